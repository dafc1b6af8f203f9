//! Recovery planner: decide the cheapest level that can reconstruct every
//! rank, fetch what is missing, verify, and hand the bytes back.
//!
//! Per-rank state machine:
//! `Scan -> VoteLevel -> FetchMissing -> Verify -> LoadIntoRegistry -> Ready`,
//! with `Failed` reachable from the vote, the fetch and the verify.
//! Checksums gate every level: a file that exists but does not verify is a
//! missing file. Levels are atomic; the planner never mixes bytes from a
//! failed level into another one.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use stratum_comm::Communicator;
use stratum_encode::{GroupDecode, decode_group, file_digest, PosixWriter, CkptWriter};
use stratum_error::{Result, StratumError};
use stratum_format::{BlockChain, ContainerReader};
use stratum_types::{CkptId, Config, Level, SerializerKind, Topology, VarId};
use tracing::{debug, info, warn};

use crate::head::hex_string;
use crate::paths::ExecPaths;
use crate::sidecar::LevelMeta;

/// Planner phases, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    Scan,
    VoteLevel,
    FetchMissing,
    Verify,
    LoadIntoRegistry,
    Ready,
    Failed,
}

/// What recovery produced on this rank.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub level: Level,
    pub cid: CkptId,
    /// Recovered variables in storage order.
    pub vars: Vec<(VarId, Vec<u8>)>,
    /// The container chain, for levels backed by the container format.
    pub chain: Option<BlockChain>,
}

/// Everything the planner needs from the engine.
pub struct RecoveryCtx<'a> {
    pub cfg: &'a Config,
    pub topo: &'a Topology,
    pub paths: &'a ExecPaths,
    pub app: &'a dyn Communicator,
    pub group: &'a dyn Communicator,
}

#[derive(Debug, Default, Clone)]
struct LevelScan {
    sidecar: Option<LevelMeta>,
    own_ok: bool,
    /// L2: the copy this rank holds for its ring neighbor verifies.
    partner_ok: bool,
    /// L3: the parity fragment held by this rank verifies.
    parity_ok: bool,
}

fn transition(from: &mut RecoveryStage, to: RecoveryStage) {
    debug!(from = ?*from, to = ?to, "recovery stage");
    *from = to;
}

/// Run the full recovery protocol. Collective over the application
/// communicator (and the group communicator for L2/L3 repair).
pub fn run(ctx: &RecoveryCtx<'_>) -> Result<RecoveryOutcome> {
    let mut stage = RecoveryStage::Scan;
    let scans = scan_levels(ctx);

    transition(&mut stage, RecoveryStage::VoteLevel);
    let Some((level, cid)) = vote_level(ctx, &scans)? else {
        transition(&mut stage, RecoveryStage::Failed);
        return Err(StratumError::Unrecoverable);
    };
    info!(%level, cid, "recovery level elected");

    transition(&mut stage, RecoveryStage::FetchMissing);
    let scan = &scans[level.index()];
    let sidecar = scan
        .sidecar
        .clone()
        .ok_or_else(|| StratumError::internal("elected level lost its sidecar"))?;
    let file = match fetch_missing(ctx, level, scan, &sidecar) {
        Ok(file) => file,
        Err(err) => {
            transition(&mut stage, RecoveryStage::Failed);
            return Err(err);
        }
    };

    transition(&mut stage, RecoveryStage::Verify);
    if !verify_level_file(ctx, level, &file, &sidecar) {
        transition(&mut stage, RecoveryStage::Failed);
        return Err(StratumError::ChecksumMismatch {
            what: format!("recovered {level} file"),
            stored: sidecar.checksum.clone(),
            computed: "unverifiable".to_owned(),
        });
    }

    transition(&mut stage, RecoveryStage::LoadIntoRegistry);
    let (vars, chain) = load_level_file(ctx, level, &file, &sidecar)?;

    transition(&mut stage, RecoveryStage::Ready);
    Ok(RecoveryOutcome {
        level,
        cid,
        vars,
        chain,
    })
}

/// Root directory the sidecar's relative `ckpt_file` resolves against.
fn level_root(ctx: &RecoveryCtx<'_>, level: Level) -> PathBuf {
    match level {
        Level::L4 => ctx.paths.global.clone(),
        _ => ctx.paths.local.clone(),
    }
}

fn container_matches(path: &PathBuf, expected_hex: &str) -> bool {
    match ContainerReader::load(path) {
        Ok(reader) => {
            let hex = String::from_utf8_lossy(&reader.meta.checksum).into_owned();
            hex == expected_hex
        }
        Err(err) => {
            debug!(file = %path.display(), error = %err, "container rejected");
            false
        }
    }
}

fn digest_matches(path: &PathBuf, expected_hex: &str) -> bool {
    file_digest(path).map(|digest| hex_string(&digest) == expected_hex).unwrap_or(false)
}

fn scan_levels(ctx: &RecoveryCtx<'_>) -> [LevelScan; 4] {
    let rank = ctx.topo.my_rank;
    let mut scans: [LevelScan; 4] = Default::default();
    for level in Level::ALL {
        let mut scan = LevelScan::default();
        let sidecar_path = ctx.paths.sidecar_file(level, rank);
        match LevelMeta::load(&sidecar_path) {
            Ok(sidecar) => {
                let file = level_root(ctx, level).join(&sidecar.ckpt_file);
                scan.own_ok = match level {
                    Level::L4 if ctx.cfg.inline_level[Level::L4.index()]
                        && ctx.cfg.io_mode == SerializerKind::Posix =>
                    {
                        digest_matches(&file, &sidecar.checksum)
                    }
                    _ => container_matches(&file, &sidecar.checksum),
                };
                if level == Level::L2 {
                    let held = ctx.paths.partner_file(ctx.topo.left);
                    scan.partner_ok = sidecar
                        .ptner_checksum
                        .as_deref()
                        .is_some_and(|expected| digest_matches(&held, expected));
                }
                if level == Level::L3 {
                    let fragment = ctx.paths.rs_file(rank, sidecar.ckpt_id);
                    scan.parity_ok = sidecar
                        .rs_checksum
                        .as_deref()
                        .is_some_and(|expected| digest_matches(&fragment, expected));
                }
                scan.sidecar = Some(sidecar);
            }
            Err(err) => {
                debug!(%level, error = %err, "no usable sidecar");
            }
        }
        scans[level.index()] = scan;
    }
    scans
}

/// Group-aware per-rank capability for one level.
fn group_capability(ctx: &RecoveryCtx<'_>, level: Level, scan: &LevelScan) -> Result<bool> {
    match level {
        Level::L1 | Level::L4 => Ok(scan.own_ok),
        Level::L2 => {
            let flags = [u8::from(scan.own_ok), u8::from(scan.partner_ok)];
            let gathered = ctx.group.allgather(&flags)?;
            let size = ctx.group.size();
            let me = ctx.group.rank();
            let holder = (me + 1) % size;
            let holder_has_copy = gathered[holder as usize].get(1).copied() == Some(1);
            Ok(scan.own_ok || holder_has_copy)
        }
        Level::L3 => {
            let flags = [u8::from(scan.own_ok), u8::from(scan.parity_ok)];
            let gathered = ctx.group.allgather(&flags)?;
            let shards: usize = gathered
                .iter()
                .map(|f| {
                    usize::from(f.first().copied() == Some(1))
                        + usize::from(f.get(1).copied() == Some(1))
                })
                .sum();
            Ok(shards >= ctx.group.size() as usize)
        }
    }
}

/// Application-wide vote: the lowest level every rank can reconstruct, with
/// a consistent checkpoint id.
fn vote_level(
    ctx: &RecoveryCtx<'_>,
    scans: &[LevelScan; 4],
) -> Result<Option<(Level, CkptId)>> {
    let mut word = Vec::with_capacity(4 * 8);
    for level in Level::ALL {
        let scan = &scans[level.index()];
        let capable = group_capability(ctx, level, scan)?;
        let cid = scan.sidecar.as_ref().map_or(0, |sidecar| sidecar.ckpt_id);
        let packed = (u64::from(capable)) << 32 | u64::from(cid);
        word.extend_from_slice(&packed.to_le_bytes());
    }
    let gathered = ctx.app.allgather(&word)?;

    for level in Level::ALL {
        let offset = level.index() * 8;
        let mut all_capable = true;
        let mut cid: Option<CkptId> = None;
        for rank_word in &gathered {
            let raw: [u8; 8] = rank_word[offset..offset + 8]
                .try_into()
                .map_err(|_| StratumError::CommFailure {
                    detail: "malformed vote word".to_owned(),
                })?;
            let packed = u64::from_le_bytes(raw);
            let capable = packed >> 32 == 1;
            let rank_cid = (packed & 0xFFFF_FFFF) as u32;
            if !capable {
                all_capable = false;
                break;
            }
            match cid {
                None => cid = Some(rank_cid),
                Some(existing) if existing != rank_cid => {
                    all_capable = false;
                    break;
                }
                Some(_) => {}
            }
        }
        if all_capable {
            if let Some(cid) = cid {
                return Ok(Some((level, cid)));
            }
        }
        debug!(%level, "level cannot reconstruct all ranks");
    }
    Ok(None)
}

/// Make this rank's file for the elected level whole, pulling remote bytes
/// where needed. Returns the local path of the (possibly rebuilt) file.
fn fetch_missing(
    ctx: &RecoveryCtx<'_>,
    level: Level,
    scan: &LevelScan,
    sidecar: &LevelMeta,
) -> Result<PathBuf> {
    let file = level_root(ctx, level).join(&sidecar.ckpt_file);
    match level {
        Level::L1 | Level::L4 => Ok(file),
        Level::L2 => {
            fetch_partner_copies(ctx, scan, sidecar, &file)?;
            Ok(file)
        }
        Level::L3 => {
            let fragment = ctx.paths.rs_file(ctx.topo.my_rank, sidecar.ckpt_id);
            let out_tmp = ctx.paths.tmp_for(Level::L3, &file);
            let input = GroupDecode {
                my_data: scan.own_ok.then_some(file.as_path()),
                my_parity: scan.parity_ok.then_some(fragment.as_path()),
                max_fs: sidecar.max_fs,
                my_fs: sidecar.fs,
                out_path: &file,
                out_tmp: &out_tmp,
                stripe_size: ctx.cfg.block_size as usize,
            };
            decode_group(ctx.group, &input)?;
            Ok(file)
        }
    }
}

/// Pairwise repair of missing L2 files: every holder streams the copy it
/// stores back to the owner. Collective over the group communicator.
fn fetch_partner_copies(
    ctx: &RecoveryCtx<'_>,
    scan: &LevelScan,
    _sidecar: &LevelMeta,
    my_file: &PathBuf,
) -> Result<()> {
    let size = ctx.group.size();
    let me = ctx.group.rank();
    let need = [u8::from(!scan.own_ok)];
    let gathered = ctx.group.allgather(&need)?;
    let tag = ctx.cfg.general_tag;
    let block = ctx.cfg.block_size as usize;

    for member in 0..size {
        if gathered[member as usize].first().copied() != Some(1) {
            continue;
        }
        let holder = (member + 1) % size;
        if member == me {
            // Receive my file back from the rank holding my copy.
            let size_bytes = ctx.group.recv(holder, tag)?;
            let raw: [u8; 8] =
                size_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StratumError::CommFailure {
                        detail: "partner repair size message must be 8 bytes".to_owned(),
                    })?;
            let total = u64::from_le_bytes(raw);
            let tmp = ctx.paths.tmp_for(Level::L2, my_file);
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut received = 0_u64;
            while received < total {
                let chunk = ctx.group.recv(holder, tag)?;
                out.write_all(&chunk)?;
                received += chunk.len() as u64;
            }
            out.sync_all()?;
            drop(out);
            fs::rename(&tmp, my_file)?;
            info!(file = %my_file.display(), "restored from partner copy");
        } else if holder == me {
            // Stream the copy I hold back to its owner.
            let owner_global = ctx.topo.left;
            let held = ctx.paths.partner_file(owner_global);
            let mut input = fs::File::open(&held)?;
            let total = input.metadata()?.len();
            ctx.group.send(member, tag, &total.to_le_bytes())?;
            let mut buffer = vec![0_u8; block];
            let mut sent = 0_u64;
            while sent < total {
                let len = ((total - sent) as usize).min(block);
                input.read_exact(&mut buffer[..len])?;
                ctx.group.send(member, tag, &buffer[..len])?;
                sent += len as u64;
            }
        }
    }
    Ok(())
}

fn verify_level_file(
    ctx: &RecoveryCtx<'_>,
    level: Level,
    file: &PathBuf,
    sidecar: &LevelMeta,
) -> bool {
    let ok = match level {
        Level::L4 if ctx.cfg.inline_level[Level::L4.index()]
            && ctx.cfg.io_mode == SerializerKind::Posix =>
        {
            digest_matches(file, &sidecar.checksum)
        }
        _ => container_matches(file, &sidecar.checksum),
    };
    if !ok {
        warn!(%level, file = %file.display(), "recovered file failed verification");
    }
    ok
}

fn load_level_file(
    ctx: &RecoveryCtx<'_>,
    level: Level,
    file: &PathBuf,
    sidecar: &LevelMeta,
) -> Result<(Vec<(VarId, Vec<u8>)>, Option<BlockChain>)> {
    if level == Level::L4
        && ctx.cfg.inline_level[Level::L4.index()]
        && ctx.cfg.io_mode == SerializerKind::Posix
    {
        let writer = PosixWriter::new();
        let vars = writer.recover(file, &sidecar.vars)?;
        return Ok((vars, None));
    }
    let reader = ContainerReader::load(file)?;
    let vars = reader.vars()?;
    Ok((vars, Some(reader.chain)))
}
