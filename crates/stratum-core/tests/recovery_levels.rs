//! End-to-end recovery scenarios across the four checkpoint levels:
//! crash after a checkpoint, restart, and byte-exact reconstruction from
//! the cheapest level that survives the injected file losses.

mod common;

use std::fs;

use common::{pattern, run_cluster, test_config};
use stratum_error::StratumError;
use stratum_types::{Config, Level, PrimitiveType, ProtectedBuffer, StatusToken, VarId};
use tempfile::tempdir;

const MIB: usize = 1 << 20;

fn char_type() -> stratum_types::TypeId {
    PrimitiveType::Char.type_id()
}

/// Protect one per-rank buffer, checkpoint at `level`, and drop the engine
/// without finalizing (the simulated crash).
fn checkpoint_and_crash(size: u32, cfg: &Config, level: Level, len: usize) {
    run_cluster(size, cfg, move |rank, engine| {
        let data = pattern(len, rank as u8);
        let buffer = ProtectedBuffer::from_vec(data);
        engine
            .protect(VarId(1), &buffer, len as u64, char_type())
            .unwrap();
        assert_eq!(
            engine.checkpoint(1, level).unwrap(),
            StatusToken::Done,
            "rank {rank} checkpoint"
        );
        // No finalize: the restart record keeps its failure flag.
    });
}

/// Restart the cluster, recover, and check every rank's buffer.
fn restart_and_expect(size: u32, cfg: &Config, len: usize, expect_level_ok: bool) {
    run_cluster(size, cfg, move |rank, engine| {
        assert!(engine.is_restart(), "rank {rank} must detect the restart");
        let buffer = ProtectedBuffer::zeroed(len);
        engine
            .protect(VarId(1), &buffer, len as u64, char_type())
            .unwrap();
        let outcome = engine.recover();
        if expect_level_ok {
            assert_eq!(outcome.unwrap(), StatusToken::Sces);
            assert_eq!(
                &*buffer.read(),
                &pattern(len, rank as u8),
                "rank {rank} buffer must be byte-identical"
            );
            assert_eq!(engine.stored_size(VarId(1)).unwrap(), len as u64);
        } else {
            assert!(matches!(outcome, Err(StratumError::Unrecoverable)));
        }
    });
}

#[test]
fn test_smoke_l1_round_trip() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 4,
        group_size: 1,
        ..test_config(dir.path())
    };
    checkpoint_and_crash(4, &cfg, Level::L1, MIB);
    restart_and_expect(4, &cfg, MIB, true);
}

#[test]
fn test_l2_survives_one_local_loss() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 1,
        group_size: 4,
        ..test_config(dir.path())
    };
    checkpoint_and_crash(4, &cfg, Level::L2, 256 * 1024);

    // Rank 0 loses its own checkpoint file; its partner still holds the copy.
    let exec = fs::read_dir(dir.path().join("local"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let lost = exec.join("l2/0-Ckpt1.fti");
    assert!(lost.exists());
    fs::remove_file(&lost).unwrap();

    restart_and_expect(4, &cfg, 256 * 1024, true);
}

#[test]
fn test_l3_survives_double_loss_but_not_triple() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 1,
        group_size: 4,
        ..test_config(dir.path())
    };
    checkpoint_and_crash(4, &cfg, Level::L3, 128 * 1024);

    let exec = fs::read_dir(dir.path().join("local"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    for rank in [2, 3] {
        fs::remove_file(exec.join(format!("l3/{rank}-Ckpt1.fti"))).unwrap();
    }
    restart_and_expect(4, &cfg, 128 * 1024, true);

    // The recovery rebuilt the lost files; losing three of them afterwards
    // exceeds the double-erasure tolerance.
    for rank in [1, 2, 3] {
        fs::remove_file(exec.join(format!("l3/{rank}-Ckpt1.fti"))).unwrap();
    }
    restart_and_expect(4, &cfg, 128 * 1024, false);
}

#[test]
fn test_l4_inline_round_trip() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 2,
        group_size: 1,
        ..test_config(dir.path())
    };
    checkpoint_and_crash(4, &cfg, Level::L4, 64 * 1024);

    // Local directories are gone entirely: only the global tier survives.
    fs::remove_dir_all(dir.path().join("local")).unwrap();
    restart_and_expect(4, &cfg, 64 * 1024, true);
}

#[test]
fn test_planner_prefers_cheapest_level() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 1,
        group_size: 4,
        ..test_config(dir.path())
    };
    // Commit L4 first, then L1: both survive, planner must pick L1.
    run_cluster(4, &cfg, |rank, engine| {
        let data = pattern(32 * 1024, rank as u8);
        let buffer = ProtectedBuffer::from_vec(data);
        engine
            .protect(VarId(1), &buffer, 32 * 1024, char_type())
            .unwrap();
        assert_eq!(engine.checkpoint(1, Level::L4).unwrap(), StatusToken::Done);
        assert_eq!(engine.checkpoint(2, Level::L1).unwrap(), StatusToken::Done);
    });
    run_cluster(4, &cfg, |rank, engine| {
        let buffer = ProtectedBuffer::zeroed(32 * 1024);
        engine
            .protect(VarId(1), &buffer, 32 * 1024, char_type())
            .unwrap();
        engine.recover().unwrap();
        let status = engine.status();
        assert_eq!(status.last_ckpt_level, Some(1), "rank {rank} level");
        assert_eq!(status.last_ckpt_id, Some(2));
        assert_eq!(&*buffer.read(), &pattern(32 * 1024, rank as u8));

        // The status snapshot serializes for host-side reporting.
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["last_ckpt_level"], 1);
        assert_eq!(json["protected_vars"], 1);
    });
}

#[test]
fn test_corrupted_file_counts_as_missing() {
    let dir = tempdir().unwrap();
    let cfg = Config {
        node_size: 1,
        group_size: 4,
        ..test_config(dir.path())
    };
    checkpoint_and_crash(4, &cfg, Level::L2, 64 * 1024);

    // Flip one payload byte in rank 1's file: checksum gating must treat
    // it as missing and repair from the partner copy.
    let exec = fs::read_dir(dir.path().join("local"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let victim = exec.join("l2/1-Ckpt1.fti");
    let mut bytes = fs::read(&victim).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x40;
    fs::write(&victim, bytes).unwrap();

    restart_and_expect(4, &cfg, 64 * 1024, true);
}
