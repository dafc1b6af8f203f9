//! Dedicated head process: receives tagged requests from the application
//! ranks on its node and performs the post-checkpoint work configured as
//! non-inline, plus file staging on a separate worker thread.
//!
//! Request/acknowledgement wire formats are little-endian and
//! length-prefixed where variable; the tag selects the protocol.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, bounded};
use stratum_comm::Communicator;
use stratum_encode::{copy_file_atomic, encode_group, exchange_partner};
use stratum_error::{Result, StratumError};
use stratum_format::hex_digest;
use stratum_types::{CkptId, Config, Level, StageState, StatusToken, Topology};
use tracing::{debug, info, warn};

use crate::paths::{ExecPaths, ckpt_file_name};
use crate::sidecar::LevelMeta;
use crate::stage::{perform_stage, resolve_remote};

/// Checkpoint request sent from an application rank to its head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CkptRequest {
    pub cid: CkptId,
    pub level: Level,
    pub fs: u64,
    pub checksum: [u8; 16],
    /// The committed local container this request refers to.
    pub local_path: PathBuf,
}

impl CkptRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let path = self.local_path.to_string_lossy();
        let mut out = Vec::with_capacity(4 + 1 + 8 + 16 + 2 + path.len());
        out.extend_from_slice(&self.cid.to_le_bytes());
        out.push(self.level.number() as u8);
        out.extend_from_slice(&self.fs.to_le_bytes());
        out.extend_from_slice(&self.checksum);
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| StratumError::CommFailure {
            detail: format!("malformed checkpoint request: {what}"),
        };
        if bytes.len() < 4 + 1 + 8 + 16 + 2 {
            return Err(corrupt("too short"));
        }
        let cid = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
        let level = Level::from_number(u32::from(bytes[4]))?;
        let fs = u64::from_le_bytes(bytes[5..13].try_into().expect("8 bytes"));
        let mut checksum = [0_u8; 16];
        checksum.copy_from_slice(&bytes[13..29]);
        let path_len = u16::from_le_bytes(bytes[29..31].try_into().expect("2 bytes")) as usize;
        if bytes.len() != 31 + path_len {
            return Err(corrupt("path length mismatch"));
        }
        let path = std::str::from_utf8(&bytes[31..]).map_err(|_| corrupt("path not utf-8"))?;
        Ok(Self {
            cid,
            level,
            fs,
            checksum,
            local_path: PathBuf::from(path),
        })
    }
}

/// Head -> application acknowledgement of a checkpoint request.
#[must_use]
pub fn encode_ckpt_ack(cid: CkptId, ok: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&cid.to_le_bytes());
    out.push(u8::from(ok));
    out
}

pub fn decode_ckpt_ack(bytes: &[u8]) -> Result<(CkptId, bool)> {
    if bytes.len() != 5 {
        return Err(StratumError::CommFailure {
            detail: format!("checkpoint ack must be 5 bytes, got {}", bytes.len()),
        });
    }
    let cid = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
    Ok((cid, bytes[4] == 1))
}

/// Staging request sent from an application rank to its head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRequest {
    pub id: u32,
    pub local: PathBuf,
    pub remote: PathBuf,
}

impl StageRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let local = self.local.to_string_lossy();
        let remote = self.remote.to_string_lossy();
        let mut out = Vec::with_capacity(4 + 4 + local.len() + 4 + remote.len());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(local.len() as u32).to_le_bytes());
        out.extend_from_slice(local.as_bytes());
        out.extend_from_slice(&(remote.len() as u32).to_le_bytes());
        out.extend_from_slice(remote.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        fn corrupt(what: &str) -> StratumError {
            StratumError::CommFailure {
                detail: format!("malformed stage request: {what}"),
            }
        }
        fn take<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
            let end = cursor.checked_add(len).ok_or_else(|| corrupt("overflow"))?;
            if end > bytes.len() {
                return Err(corrupt("too short"));
            }
            let slice = &bytes[*cursor..end];
            *cursor = end;
            Ok(slice)
        }

        let mut cursor = 0_usize;
        let id = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("4 bytes"));
        let local_len =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("4 bytes")) as usize;
        let local = std::str::from_utf8(take(bytes, &mut cursor, local_len)?)
            .map_err(|_| corrupt("local path"))?;
        let local = PathBuf::from(local);
        let remote_len =
            u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().expect("4 bytes")) as usize;
        let remote = std::str::from_utf8(take(bytes, &mut cursor, remote_len)?)
            .map_err(|_| corrupt("remote path"))?;
        Ok(Self {
            id,
            local,
            remote: PathBuf::from(remote),
        })
    }
}

/// Head -> application staging status update.
#[must_use]
pub fn encode_stage_ack(id: u32, state: StageState) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&id.to_le_bytes());
    out.push(state.code());
    out
}

pub fn decode_stage_ack(bytes: &[u8]) -> Result<(u32, StageState)> {
    if bytes.len() != 5 {
        return Err(StratumError::CommFailure {
            detail: format!("stage ack must be 5 bytes, got {}", bytes.len()),
        });
    }
    let id = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
    let state = match bytes[4] {
        0x1 => StageState::Pending,
        0x2 => StageState::Active,
        0x3 => StageState::Success,
        0x4 => StageState::Failed,
        _ => StageState::NotInitialized,
    };
    Ok((id, state))
}

struct StageJob {
    requester: u32,
    request: StageRequest,
}

/// The head-side state: communicators, layout, and the staging worker.
pub struct HeadProcess {
    cfg: Config,
    topo: Topology,
    global: Arc<dyn Communicator>,
    head_group: Box<dyn Communicator>,
    paths: ExecPaths,
}

impl HeadProcess {
    pub fn new(
        cfg: Config,
        topo: Topology,
        global: Arc<dyn Communicator>,
        head_group: Box<dyn Communicator>,
        paths: ExecPaths,
    ) -> Self {
        Self {
            cfg,
            topo,
            global,
            head_group,
            paths,
        }
    }

    fn spawn_stage_worker(&self) -> (Sender<StageJob>, JoinHandle<()>) {
        let (tx, rx) = bounded::<StageJob>(64);
        let comm = Arc::clone(&self.global);
        let stage_tag = self.cfg.stage_tag;
        let stage_dir = self.paths.stage.clone();
        let handle = thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                let remote = resolve_remote(&stage_dir, &job.request.remote);
                let state = match perform_stage(&job.request.local, &remote) {
                    Ok(()) => StageState::Success,
                    Err(err) => {
                        warn!(id = job.request.id, error = %err, "staging transfer failed");
                        StageState::Failed
                    }
                };
                let ack = encode_stage_ack(job.request.id, state);
                if comm.send(job.requester, stage_tag, &ack).is_err() {
                    warn!(requester = job.requester, "could not deliver stage ack");
                }
            }
        });
        (tx, handle)
    }

    /// Listen for requests until every application rank on this node has
    /// sent its finalize message.
    pub fn run(mut self) -> Result<StatusToken> {
        let (stage_tx, stage_handle) = self.spawn_stage_worker();
        let tags = [self.cfg.ckpt_tag, self.cfg.stage_tag, self.cfg.final_tag];
        let mut pending: HashMap<(CkptId, Level), Vec<(u32, CkptRequest)>> = HashMap::new();
        let mut finalized = 0_u32;

        info!(node = self.topo.node_id, "head listening");
        loop {
            let (src, tag, payload) = self.global.recv_any(&tags)?;
            if tag == self.cfg.final_tag {
                finalized += 1;
                debug!(src, finalized, "finalize request");
                if finalized == self.topo.nb_approcs {
                    break;
                }
            } else if tag == self.cfg.stage_tag {
                let request = StageRequest::decode(&payload)?;
                stage_tx
                    .send(StageJob {
                        requester: src,
                        request,
                    })
                    .map_err(|_| StratumError::internal("stage worker is gone"))?;
            } else {
                let request = CkptRequest::decode(&payload)?;
                let key = (request.cid, request.level);
                let entry = pending.entry(key).or_default();
                entry.push((src, request));
                if entry.len() == self.topo.nb_approcs as usize {
                    let requests = pending.remove(&key).expect("entry just filled");
                    self.process_ckpt(key.0, key.1, requests);
                }
            }
        }

        drop(stage_tx);
        stage_handle
            .join()
            .map_err(|_| StratumError::internal("stage worker panicked"))?;
        info!(node = self.topo.node_id, "head finished");
        if self.cfg.keep_heads_alive {
            Ok(StatusToken::Head)
        } else {
            Ok(StatusToken::Sces)
        }
    }

    /// Post-process one checkpoint cycle for every application rank of this
    /// node. Failures mark the level failed for the affected rank (no
    /// sidecar is written) but never tear the head down.
    fn process_ckpt(&mut self, cid: CkptId, level: Level, mut requests: Vec<(u32, CkptRequest)>) {
        requests.sort_by_key(|&(src, _)| src);
        info!(cid, %level, "processing offloaded checkpoint work");
        for (src, request) in requests {
            let outcome = match level {
                Level::L2 => self.partner_for_slot(src, &request),
                Level::L3 => self.encode_for_slot(src, cid, &request),
                Level::L4 => self.flush_for_slot(src, cid, &request),
                Level::L1 => Err(StratumError::internal("L1 is always inline")),
            };
            let ok = match outcome {
                Ok(()) => true,
                Err(err) => {
                    warn!(cid, %level, rank = src, error = %err, "offloaded work failed");
                    false
                }
            };
            if self.global.send(src, self.cfg.ckpt_tag, &encode_ckpt_ack(cid, ok)).is_err() {
                warn!(rank = src, "could not deliver checkpoint ack");
            }
        }
    }

    /// Node rank slot of an application rank on this node.
    fn slot_of(&self, app_global: u32) -> u32 {
        app_global % self.topo.node_size
    }

    fn partner_for_slot(&mut self, src: u32, request: &CkptRequest) -> Result<()> {
        let group_size = self.topo.group_size;
        let group_rank = self.topo.group_rank;
        let holder = (group_rank + 1) % group_size;
        let owner = (group_rank + group_size - 1) % group_size;
        // The owner of the copy this node stores: the peer of `src` on the
        // left ring node.
        let sector_base = self.topo.sector_id * group_size;
        let owner_node = sector_base + owner;
        let owner_rank = owner_node * self.topo.node_size + self.slot_of(src);
        let partner_file = self.paths.partner_file(owner_rank);
        let partner_tmp = self.paths.tmp_for(Level::L2, &partner_file);

        let copy = exchange_partner(
            self.head_group.as_ref(),
            holder,
            owner,
            self.cfg.ckpt_tag,
            &request.local_path,
            &partner_file,
            &partner_tmp,
            self.cfg.block_size as usize,
        )?;
        let meta = LevelMeta {
            ckpt_file: relative_to(&request.local_path, &self.paths.local),
            ckpt_id: request.cid,
            fs: request.fs,
            max_fs: request.fs,
            pfs: copy.pt_fs,
            checksum: hex_string(&request.checksum),
            ptner_checksum: Some(hex_string(&copy.digest)),
            rs_checksum: None,
            vars: Vec::new(),
        };
        meta.store(&self.paths.sidecar_file(Level::L2, src))
    }

    fn encode_for_slot(&mut self, src: u32, cid: CkptId, request: &CkptRequest) -> Result<()> {
        let parity_path = self.paths.rs_file(src, cid);
        let parity_tmp = self.paths.tmp_for(Level::L3, &parity_path);
        let outcome = encode_group(
            self.head_group.as_ref(),
            &request.local_path,
            &parity_path,
            &parity_tmp,
            self.cfg.block_size as usize,
        )?;
        let meta = LevelMeta {
            ckpt_file: relative_to(&request.local_path, &self.paths.local),
            ckpt_id: cid,
            fs: request.fs,
            max_fs: outcome.max_fs,
            pfs: 0,
            checksum: hex_string(&request.checksum),
            ptner_checksum: None,
            rs_checksum: outcome.parity.map(|fragment| hex_string(&fragment.digest)),
            vars: Vec::new(),
        };
        meta.store(&self.paths.sidecar_file(Level::L3, src))
    }

    fn flush_for_slot(&mut self, src: u32, cid: CkptId, request: &CkptRequest) -> Result<()> {
        let dst = self
            .paths
            .level_dir(Level::L4)
            .join(ckpt_file_name(src, cid));
        let tmp = self.paths.tmp_for(Level::L4, &dst);
        let (fs, digest) = copy_file_atomic(
            &request.local_path,
            &dst,
            &tmp,
            self.cfg.transfer_size as usize,
        )?;
        if digest != request.checksum {
            let _ = std::fs::remove_file(&dst);
            return Err(StratumError::ChecksumMismatch {
                what: format!("flushed checkpoint of rank {src}"),
                stored: hex_string(&request.checksum),
                computed: hex_string(&digest),
            });
        }
        let meta = LevelMeta {
            ckpt_file: format!("{}/{}", Level::L4.dir_name(), ckpt_file_name(src, cid)),
            ckpt_id: cid,
            fs,
            max_fs: fs,
            pfs: 0,
            checksum: hex_string(&digest),
            ptner_checksum: None,
            rs_checksum: None,
            vars: Vec::new(),
        };
        meta.store(&self.paths.sidecar_file(Level::L4, src))?;
        // Staged scratch files are consumed by the flush; persistent
        // containers (the dCP file) stay in place.
        if request
            .local_path
            .parent()
            .is_some_and(|parent| parent.ends_with("tmp"))
        {
            let _ = std::fs::remove_file(&request.local_path);
        }
        Ok(())
    }
}

/// Hex string of a raw digest.
#[must_use]
pub fn hex_string(digest: &[u8; 16]) -> String {
    String::from_utf8_lossy(&hex_digest(digest)).into_owned()
}

/// Path relative to `root`, or the full path when outside it.
fn relative_to(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ckpt_request_round_trip() {
        let request = CkptRequest {
            cid: 12,
            level: Level::L3,
            fs: 1 << 30,
            checksum: [0xAB; 16],
            local_path: PathBuf::from("/local/exec/l3/5-Ckpt12.fti"),
        };
        let decoded = CkptRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_ckpt_request_rejects_truncation() {
        let request = CkptRequest {
            cid: 1,
            level: Level::L1,
            fs: 10,
            checksum: [0; 16],
            local_path: PathBuf::from("x"),
        };
        let mut bytes = request.encode();
        bytes.pop();
        assert!(CkptRequest::decode(&bytes).is_err());
    }

    #[test]
    fn test_stage_request_round_trip() {
        let request = StageRequest {
            id: 7,
            local: PathBuf::from("/local/file.dat"),
            remote: PathBuf::from("archive/file.dat"),
        };
        assert_eq!(StageRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_acks_round_trip() {
        assert_eq!(decode_ckpt_ack(&encode_ckpt_ack(9, true)).unwrap(), (9, true));
        assert_eq!(
            decode_stage_ack(&encode_stage_ack(3, StageState::Failed)).unwrap(),
            (3, StageState::Failed)
        );
    }
}
