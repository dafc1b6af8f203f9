//! Head-process scenarios: offloaded L4 flush, offloaded L2 partner
//! exchange, and staging through the head's worker thread.

mod common;

use std::fs;
use std::time::{Duration, Instant};

use common::{pattern, run_cluster, test_config};
use stratum_types::{Config, Level, PrimitiveType, ProtectedBuffer, StageState, StatusToken, VarId};
use tempfile::tempdir;

fn char_type() -> stratum_types::TypeId {
    PrimitiveType::Char.type_id()
}

#[test]
fn test_offline_l4_flush_and_recovery() {
    let dir = tempdir().unwrap();
    let mut cfg = Config {
        node_size: 2,
        heads_per_node: 1,
        group_size: 1,
        keep_last_ckpt: true,
        ..test_config(dir.path())
    };
    cfg.inline_level[Level::L4.index()] = false;

    // 2 nodes x (1 head + 1 app).
    run_cluster(4, &cfg, |_rank, engine| {
        let rank = engine.topology().my_rank;
        let data = pattern(128 * 1024, rank as u8);
        let buffer = ProtectedBuffer::from_vec(data);
        engine
            .protect(VarId(1), &buffer, 128 * 1024, char_type())
            .unwrap();
        assert_eq!(engine.checkpoint(1, Level::L4).unwrap(), StatusToken::Done);
        assert_eq!(engine.finalize().unwrap(), StatusToken::Sces);
    });

    // The flushed files live on the global tier.
    let exec = fs::read_dir(dir.path().join("global"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    assert!(exec.join("l4/1-Ckpt1.fti").exists());
    assert!(exec.join("l4/3-Ckpt1.fti").exists());

    // keep_last_ckpt leaves the restart flag set: the next run recovers.
    run_cluster(4, &cfg, |_rank, engine| {
        assert!(engine.is_restart());
        let rank = engine.topology().my_rank;
        let buffer = ProtectedBuffer::zeroed(128 * 1024);
        engine
            .protect(VarId(1), &buffer, 128 * 1024, char_type())
            .unwrap();
        engine.recover().unwrap();
        assert_eq!(&*buffer.read(), &pattern(128 * 1024, rank as u8));
        engine.finalize().unwrap();
    });
}

#[test]
fn test_offline_l2_partner_exchange() {
    let dir = tempdir().unwrap();
    let mut cfg = Config {
        node_size: 2,
        heads_per_node: 1,
        group_size: 4,
        keep_last_ckpt: true,
        ..test_config(dir.path())
    };
    cfg.inline_level[Level::L2.index()] = false;

    // 4 nodes x (1 head + 1 app), one partner ring of four.
    run_cluster(8, &cfg, |_rank, engine| {
        let rank = engine.topology().my_rank;
        let data = pattern(64 * 1024, rank as u8);
        let buffer = ProtectedBuffer::from_vec(data);
        engine
            .protect(VarId(1), &buffer, 64 * 1024, char_type())
            .unwrap();
        assert_eq!(engine.checkpoint(1, Level::L2).unwrap(), StatusToken::Done);
        engine.finalize().unwrap();
    });

    // Lose one app rank's own checkpoint; its copy survives on the ring.
    let exec = fs::read_dir(dir.path().join("local"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    fs::remove_file(exec.join("l2/1-Ckpt1.fti")).unwrap();

    run_cluster(8, &cfg, |_rank, engine| {
        assert!(engine.is_restart());
        let rank = engine.topology().my_rank;
        let buffer = ProtectedBuffer::zeroed(64 * 1024);
        engine
            .protect(VarId(1), &buffer, 64 * 1024, char_type())
            .unwrap();
        engine.recover().unwrap();
        assert_eq!(&*buffer.read(), &pattern(64 * 1024, rank as u8));
        engine.finalize().unwrap();
    });
}

#[test]
fn test_staging_through_head() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 2,
        heads_per_node: 1,
        group_size: 1,
        enable_staging: true,
        ..test_config(dir.path())
    };
    let stage_root = dir.path().join("stage");
    let payload_dir = dir.path().join("outbox");
    fs::create_dir_all(&payload_dir).unwrap();

    run_cluster(2, &cfg, move |_rank, engine| {
        let rank = engine.topology().my_rank;
        let local = payload_dir.join(format!("result-{rank}.dat"));
        fs::write(&local, pattern(10_000, rank as u8)).unwrap();

        let id = engine
            .stage(&local, std::path::Path::new(&format!("result-{rank}.dat")))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            match engine.stage_status(id) {
                StageState::Success => break,
                StageState::Failed => panic!("staging failed"),
                _ if Instant::now() > deadline => panic!("staging timed out"),
                _ => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        assert!(!local.exists(), "source consumed by the transfer");
        engine.finalize().unwrap();
    });

    assert_eq!(
        fs::read(stage_root.join("result-1.dat")).unwrap(),
        pattern(10_000, 1)
    );
}

#[test]
fn test_stage_without_head_runs_inline() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 1,
        group_size: 1,
        enable_staging: true,
        ..test_config(dir.path())
    };
    let payload = dir.path().join("inline.dat");
    fs::write(&payload, b"inline staging").unwrap();
    let stage_root = dir.path().join("stage");

    run_cluster(1, &cfg, move |_rank, engine| {
        let id = engine
            .stage(&payload, std::path::Path::new("inline.dat"))
            .unwrap();
        assert_eq!(engine.stage_status(id), StageState::Success);
        engine.finalize().unwrap();
    });
    assert_eq!(fs::read(stage_root.join("inline.dat")).unwrap(), b"inline staging");
}
