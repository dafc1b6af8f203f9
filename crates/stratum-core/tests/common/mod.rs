//! Shared helpers for the multi-rank engine scenarios.

use std::path::Path;
use std::sync::{Arc, Once};
use std::thread;

use stratum_comm::LocalCluster;
use stratum_core::engine::{Engine, InitOutcome};
use stratum_types::{Config, StatusToken};

static TRACING: Once = Once::new();

/// Install the test subscriber once so engine warnings surface in failures.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

/// Configuration rooted in a scratch directory.
pub fn test_config(root: &Path) -> Config {
    Config {
        local_dir: root.join("local"),
        global_dir: root.join("global"),
        meta_dir: root.join("meta"),
        stage_dir: root.join("stage"),
        block_size: 64 * 1024,
        ..Config::default()
    }
}

/// Run `body` with a live engine on every application rank of a fresh
/// cluster; head processes run their loop and return their token.
pub fn run_cluster<F>(size: u32, cfg: &Config, body: F)
where
    F: Fn(u32, &mut Engine) + Send + Sync + 'static,
{
    init_tracing();
    let body = Arc::new(body);
    let handles: Vec<_> = LocalCluster::new(size)
        .into_iter()
        .map(|comm| {
            let cfg = cfg.clone();
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let rank = stratum_comm::Communicator::rank(&comm);
                match Engine::init(cfg, Box::new(comm)).expect("init") {
                    InitOutcome::App(mut engine) => body(rank, engine.as_mut()),
                    InitOutcome::Head(token) => {
                        assert_ne!(token, StatusToken::Nscs, "head loop failed");
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("rank thread panicked");
    }
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|index| (index % 256) as u8 ^ seed).collect()
}
