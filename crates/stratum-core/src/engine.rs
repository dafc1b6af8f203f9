//! The checkpoint engine: one value per execution, created by
//! [`Engine::init`] and consumed by [`Engine::finalize`].
//!
//! Application ranks get an `Engine`; a dedicated head process never
//! returns one, it runs the head loop inside `init` and comes back with a
//! status token once the application finalizes.
//!
//! Error policy: level encoders never raise to the caller. `checkpoint`
//! and `snapshot` report `Nscs` and keep the previous committed checkpoint
//! authoritative; only `init`, `recover`, `finalize` and `finalize_icp`
//! surface hard errors.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use stratum_comm::Communicator;
use stratum_encode::{
    CkptWriter, PosixWriter, encode_group, exchange_partner, writer_for,
};
use stratum_error::{Result, StratumError};
use stratum_format::{
    BlockChain, CommitMode, DcpConfig, VarSnapshot, write_container,
};
use stratum_types::{
    CkptId, CompositeType, Config, DeviceStager, Level, Placement, ProtectedBuffer, StageState,
    StatusToken, Topology, TypeId, VarId,
};
use tracing::{info, warn};

use crate::head::{
    CkptRequest, HeadProcess, StageRequest, decode_ckpt_ack, decode_stage_ack, hex_string,
};
use crate::paths::{ExecPaths, ckpt_file_name};
use crate::recover::{self, RecoveryCtx};
use crate::registry::DataRegistry;
use crate::sidecar::{LevelMeta, RestartRecord};
use crate::snapshot::SnapshotSched;
use crate::stage::{StageId, StageTable, perform_stage, resolve_remote};

/// What `init` produced on this process.
pub enum InitOutcome {
    /// An application rank: the engine is live.
    App(Box<Engine>),
    /// A head process that already ran its loop to completion.
    Head(StatusToken),
}

/// Point-in-time engine state for hosts.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub exec_id: String,
    pub restart: bool,
    pub last_ckpt_id: Option<CkptId>,
    pub last_ckpt_level: Option<u32>,
    pub protected_vars: usize,
    pub protected_bytes: u64,
    pub staging_requests: usize,
}

enum IcpWrite {
    /// Container-backed levels stage copies and write at finalize.
    Staged { snapshots: Vec<(VarId, Vec<u8>)> },
    /// Inline L4 streams through the open writer handle.
    Posix {
        writer: Box<dyn CkptWriter>,
        tmp: PathBuf,
    },
}

struct IcpState {
    cid: CkptId,
    level: Level,
    added: Vec<VarId>,
    failed: bool,
    write: IcpWrite,
}

struct PendingOffline {
    cid: CkptId,
    level: Level,
    vars: Vec<(VarId, u64)>,
}

/// The per-rank checkpoint engine.
pub struct Engine {
    cfg: Config,
    topo: Topology,
    exec_id: String,
    restart: bool,
    global: Arc<dyn Communicator>,
    app: Box<dyn Communicator>,
    group: Box<dyn Communicator>,
    node: Box<dyn Communicator>,
    paths: ExecPaths,
    registry: DataRegistry,
    chain: BlockChain,
    last_ckpt: Option<(CkptId, Level)>,
    level_last_cid: [Option<CkptId>; 4],
    committed_vars: Vec<VarId>,
    next_cid: CkptId,
    stage_table: StageTable,
    pending_offline: Option<PendingOffline>,
    icp: Option<IcpState>,
    stager: Option<Box<dyn DeviceStager>>,
    sched: SnapshotSched,
    iter_count: u64,
    sync_interval: u64,
    synced_minute: u32,
    started: Instant,
    finalized: bool,
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

impl Engine {
    /// Initialize the engine on every process of `global`.
    ///
    /// Collective. Head processes run their listen loop inside this call
    /// and return [`InitOutcome::Head`] when the application finalizes.
    pub fn init(mut cfg: Config, global: Box<dyn Communicator>) -> Result<InitOutcome> {
        cfg.validate()?;
        let topo = Topology::derive(&cfg, global.size(), global.rank())?;
        let global: Arc<dyn Communicator> = Arc::from(global);

        // Execution identity: rank 0 mints or restores it, everyone else
        // follows the broadcast.
        let mut restart = false;
        let mut exec_id = String::new();
        if topo.my_rank == 0 {
            fs::create_dir_all(&cfg.meta_dir)?;
            let record_path = cfg.meta_dir.join("restart");
            match RestartRecord::load(&record_path) {
                Some(record) if record.failure => {
                    restart = true;
                    exec_id = record.exec_id;
                    info!(%exec_id, "this is a restart");
                }
                _ => {
                    exec_id = format!("exec-{}", unix_seconds());
                    info!(%exec_id, "new execution");
                }
            }
            RestartRecord {
                failure: true,
                exec_id: exec_id.clone(),
            }
            .store(&record_path)?;
        }
        let mut payload = vec![u8::from(restart)];
        payload.extend_from_slice(exec_id.as_bytes());
        let payload = global.broadcast(0, &payload)?;
        let restart = payload.first().copied() == Some(1);
        let exec_id = String::from_utf8_lossy(&payload[1..]).into_owned();
        global.barrier()?;

        let paths = ExecPaths::resolve(&cfg, &exec_id);
        paths.create_all(cfg.keep_l4)?;
        global.barrier()?;

        let role = global.split(u32::from(topo.am_head), topo.split_rank)?;
        if topo.am_head {
            let head_group = role.split(topo.sector_id, topo.group_rank)?;
            let head = HeadProcess::new(cfg, topo, Arc::clone(&global), head_group, paths);
            return Ok(InitOutcome::Head(head.run()?));
        }
        let node = role.split(topo.node_id, topo.node_rank)?;
        let group = role.split(
            topo.sector_id * topo.node_size + topo.node_rank,
            topo.group_rank,
        )?;

        Ok(InitOutcome::App(Box::new(Self {
            cfg,
            topo,
            exec_id,
            restart,
            global,
            app: role,
            group,
            node,
            paths,
            registry: DataRegistry::new(),
            chain: BlockChain::new(),
            last_ckpt: None,
            level_last_cid: [None; 4],
            committed_vars: Vec::new(),
            next_cid: 1,
            stage_table: StageTable::new(),
            pending_offline: None,
            icp: None,
            stager: None,
            sched: SnapshotSched::new(),
            iter_count: 0,
            sync_interval: 1,
            synced_minute: 0,
            started: Instant::now(),
            finalized: false,
        })))
    }

    /// Whether this execution restarted from a crash.
    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.restart
    }

    /// Derived topology of this rank.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// Execution id of the current run.
    #[must_use]
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Current engine state.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            exec_id: self.exec_id.clone(),
            restart: self.restart,
            last_ckpt_id: self.last_ckpt.map(|(cid, _)| cid),
            last_ckpt_level: self.last_ckpt.map(|(_, level)| level.number()),
            protected_vars: self.registry.len(),
            protected_bytes: self.registry.total_size(),
            staging_requests: self.stage_table.len(),
        }
    }

    /// Install the device staging callback.
    pub fn set_device_stager(&mut self, stager: Box<dyn DeviceStager>) {
        self.stager = Some(stager);
    }

    // ------------------------------------------------------------------
    // Registry surface
    // ------------------------------------------------------------------

    pub fn protect(
        &mut self,
        id: VarId,
        buffer: &ProtectedBuffer,
        count: u64,
        type_id: TypeId,
    ) -> Result<()> {
        self.registry.protect(id, buffer, count, type_id)
    }

    pub fn protect_sized(
        &mut self,
        count: u64,
        type_id: TypeId,
        placement: Placement,
    ) -> Result<(VarId, ProtectedBuffer)> {
        self.registry.protect_sized(count, type_id, placement)
    }

    pub fn protected_free(&mut self, id: VarId) -> Result<()> {
        self.registry.free(id)
    }

    pub fn get_protected(&self, id: VarId) -> Result<ProtectedBuffer> {
        self.registry.get(id).map(|var| var.buffer.clone())
    }

    pub fn realloc(&mut self, id: VarId, new_count: u64) -> Result<ProtectedBuffer> {
        self.registry.realloc(id, new_count)
    }

    pub fn define_dataset(
        &mut self,
        id: VarId,
        dims: Vec<u64>,
        name: impl Into<String>,
        group: Option<String>,
    ) -> Result<()> {
        self.registry.define_dataset(id, dims, name, group)
    }

    pub fn stored_size(&self, id: VarId) -> Result<u64> {
        self.registry.stored_size(id)
    }

    pub fn init_type(&mut self, size: usize, name: impl Into<String>) -> TypeId {
        self.registry.init_type(size, name)
    }

    pub fn init_composite(&mut self, size: usize, composite: CompositeType) -> Result<TypeId> {
        self.registry.init_composite(size, composite)
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    fn dcp_config(&self) -> Option<DcpConfig> {
        if !self.cfg.enable_dcp {
            return None;
        }
        DcpConfig::new(self.cfg.dcp_mode, self.cfg.dcp_block_size).ok()
    }

    /// Container destination for a local (L1-L3) or staged (offline L4)
    /// checkpoint of this cycle.
    fn container_target(&self, cid: CkptId, level: Level) -> (PathBuf, bool) {
        let rank = self.topo.my_rank;
        if self.dcp_config().is_some() {
            return (self.paths.dcp_file(rank), true);
        }
        if level == Level::L4 {
            // Offline flush: stage in the local scratch, the head moves it.
            return (self.paths.local_tmp().join(ckpt_file_name(rank, cid)), false);
        }
        (self.paths.ckpt_file(level, rank, cid), false)
    }

    /// Perform a checkpoint of every protected variable at `level`.
    pub fn checkpoint(&mut self, cid: CkptId, level: Level) -> Result<StatusToken> {
        if self.icp.is_some() {
            warn!("checkpoint refused while an incremental checkpoint is active");
            return Ok(StatusToken::Nscs);
        }
        if let Err(err) = self.drain_pending_ack() {
            warn!(error = %err, "previous offloaded checkpoint failed");
        }
        match self.do_checkpoint(cid, level) {
            Ok(()) => {
                self.next_cid = self.next_cid.max(cid + 1);
                Ok(StatusToken::Done)
            }
            Err(err) => {
                warn!(cid, %level, error = %err, "checkpoint failed");
                Ok(StatusToken::Nscs)
            }
        }
    }

    fn do_checkpoint(&mut self, cid: CkptId, level: Level) -> Result<()> {
        self.registry.stage_device_vars(self.stager.as_deref())?;
        let inline = self.cfg.inline_level[level.index()];

        if level == Level::L4 && inline {
            return self.flush_l4_inline(cid);
        }

        let sizes: Vec<(VarId, u64)> = self
            .registry
            .iter()
            .map(|var| (var.id, var.byte_size()))
            .collect();
        // Buffer handles are cloned out of the registry so the read guards
        // do not pin the engine while the writer runs.
        let handles: Vec<(VarId, ProtectedBuffer)> = self
            .registry
            .iter()
            .map(|var| (var.id, var.buffer.clone()))
            .collect();
        let summary = {
            let guards: Vec<_> = handles
                .iter()
                .enumerate()
                .map(|(index, (id, buffer))| (*id, index as u32, buffer.read()))
                .collect::<Vec<_>>();
            let snapshots: Vec<VarSnapshot<'_>> = guards
                .iter()
                .map(|(id, index, guard)| VarSnapshot {
                    id: *id,
                    idx: *index,
                    bytes: guard.as_slice(),
                })
                .collect();
            self.write_local_container(cid, level, &snapshots)?
        };

        if inline {
            self.inline_post_process(cid, level, summary, &sizes)
        } else {
            self.send_offline_request(cid, level, &summary, sizes)
        }
    }

    fn write_local_container(
        &mut self,
        cid: CkptId,
        level: Level,
        snapshots: &[VarSnapshot<'_>],
    ) -> Result<LocalWrite> {
        let (path, in_place) = self.container_target(cid, level);
        let dcp = self.dcp_config();
        let summary = if in_place {
            write_container(&path, CommitMode::InPlace, &mut self.chain, snapshots, dcp)?
        } else {
            let name = path
                .file_name()
                .map_or_else(|| "container".to_owned(), |n| n.to_string_lossy().into_owned());
            let tmp = self.paths.local_tmp().join(format!("{name}.part"));
            write_container(
                &path,
                CommitMode::AtomicRename { tmp: &tmp },
                &mut self.chain,
                snapshots,
                dcp,
            )?
        };
        Ok(LocalWrite {
            path,
            fs: summary.fs,
            checksum_hex: String::from_utf8_lossy(&summary.meta.checksum).into_owned(),
            checksum_raw: hex_to_raw(&summary.meta.checksum),
        })
    }

    fn inline_post_process(
        &mut self,
        cid: CkptId,
        level: Level,
        local: LocalWrite,
        sizes: &[(VarId, u64)],
    ) -> Result<()> {
        let mut pfs = 0_u64;
        let mut ptner_checksum = None;
        let mut rs_checksum = None;
        let mut max_fs = local.fs;

        match level {
            Level::L1 | Level::L4 => {}
            Level::L2 => {
                let group_size = self.group.size();
                let me = self.group.rank();
                let holder = (me + 1) % group_size;
                let owner = (me + group_size - 1) % group_size;
                let partner_file = self.paths.partner_file(self.topo.left);
                let partner_tmp = self.paths.tmp_for(Level::L2, &partner_file);
                let copy = exchange_partner(
                    self.group.as_ref(),
                    holder,
                    owner,
                    self.cfg.ckpt_tag,
                    &local.path,
                    &partner_file,
                    &partner_tmp,
                    self.cfg.block_size as usize,
                )?;
                pfs = copy.pt_fs;
                ptner_checksum = Some(hex_string(&copy.digest));
            }
            Level::L3 => {
                let parity_path = self.paths.rs_file(self.topo.my_rank, cid);
                let parity_tmp = self.paths.tmp_for(Level::L3, &parity_path);
                let outcome = encode_group(
                    self.group.as_ref(),
                    &local.path,
                    &parity_path,
                    &parity_tmp,
                    self.cfg.block_size as usize,
                )?;
                max_fs = outcome.max_fs;
                rs_checksum = outcome.parity.map(|fragment| hex_string(&fragment.digest));
            }
        }

        // Commit protocol: every rank renamed durably, then sidecars, then
        // the commit barrier that makes the level trustworthy.
        self.app.barrier()?;
        let meta = LevelMeta {
            ckpt_file: self.relative_local(&local.path),
            ckpt_id: cid,
            fs: local.fs,
            max_fs,
            pfs,
            checksum: local.checksum_hex.clone(),
            ptner_checksum,
            rs_checksum,
            vars: sizes.to_vec(),
        };
        meta.store(&self.paths.sidecar_file(level, self.topo.my_rank))?;
        self.app.barrier()?;

        let previous = self.level_last_cid[level.index()];
        self.commit_state(cid, level, sizes);
        self.retention(level, previous, cid)?;
        Ok(())
    }

    fn send_offline_request(
        &mut self,
        cid: CkptId,
        level: Level,
        local: &LocalWrite,
        sizes: Vec<(VarId, u64)>,
    ) -> Result<()> {
        let head = self
            .topo
            .head_rank
            .ok_or_else(|| StratumError::config("offline level without a head process"))?;
        let request = CkptRequest {
            cid,
            level,
            fs: local.fs,
            checksum: local.checksum_raw,
            local_path: local.path.clone(),
        };
        self.global.send(head, self.cfg.ckpt_tag, &request.encode())?;
        self.pending_offline = Some(PendingOffline { cid, level, vars: sizes });
        info!(cid, %level, "checkpoint work offloaded to head");
        Ok(())
    }

    /// Wait for the head's acknowledgement of the previous offloaded
    /// checkpoint, then commit or discard it.
    fn drain_pending_ack(&mut self) -> Result<()> {
        let Some(pending) = self.pending_offline.take() else {
            return Ok(());
        };
        let head = self
            .topo
            .head_rank
            .ok_or_else(|| StratumError::internal("pending offline work without a head"))?;
        let payload = self.global.recv(head, self.cfg.ckpt_tag)?;
        let (ack_cid, ok) = decode_ckpt_ack(&payload)?;
        if ack_cid != pending.cid {
            warn!(ack_cid, expected = pending.cid, "out-of-order checkpoint ack");
        }
        self.app.barrier()?;
        if ok {
            let previous = self.level_last_cid[pending.level.index()];
            self.commit_state(pending.cid, pending.level, &pending.vars);
            self.retention(pending.level, previous, pending.cid)?;
            Ok(())
        } else {
            Err(StratumError::internal(format!(
                "head reported failure for checkpoint {}",
                pending.cid
            )))
        }
    }

    fn flush_l4_inline(&mut self, cid: CkptId) -> Result<()> {
        let mut writer = writer_for(self.cfg.io_mode)?;
        let dst = self.paths.ckpt_file(Level::L4, self.topo.my_rank, cid);
        let tmp = self.paths.tmp_for(Level::L4, &dst);
        writer.open(&dst, &tmp)?;
        for var in self.registry.iter() {
            writer.write_var(var.id, &var.buffer.read())?;
        }
        let receipt = writer.finalize()?;

        self.app.barrier()?;
        let meta = LevelMeta {
            ckpt_file: format!(
                "{}/{}",
                Level::L4.dir_name(),
                ckpt_file_name(self.topo.my_rank, cid)
            ),
            ckpt_id: cid,
            fs: receipt.fs,
            max_fs: receipt.fs,
            pfs: 0,
            checksum: hex_string(&receipt.digest),
            ptner_checksum: None,
            rs_checksum: None,
            vars: receipt.vars.clone(),
        };
        meta.store(&self.paths.sidecar_file(Level::L4, self.topo.my_rank))?;
        self.app.barrier()?;

        let previous = self.level_last_cid[Level::L4.index()];
        self.commit_state(cid, Level::L4, &receipt.vars);
        self.retention(Level::L4, previous, cid)?;
        Ok(())
    }

    fn commit_state(&mut self, cid: CkptId, level: Level, sizes: &[(VarId, u64)]) {
        self.level_last_cid[level.index()] = Some(cid);
        self.last_ckpt = Some((cid, level));
        self.committed_vars = sizes.iter().map(|&(id, _)| id).collect();
        self.registry.set_stored_sizes(sizes);
        info!(cid, %level, "checkpoint committed");
    }

    /// Drop the previous cycle's files at `level`; with `keep_l4` the old
    /// L4 set moves into the archive instead. Retention keeps exactly one
    /// committed cycle per level.
    fn retention(&mut self, level: Level, previous: Option<CkptId>, current: CkptId) -> Result<()> {
        self.node.barrier()?;
        let Some(old) = previous else {
            return Ok(());
        };
        if old == current {
            return Ok(());
        }
        let rank = self.topo.my_rank;
        let old_file = self.paths.ckpt_file(level, rank, old);
        if old_file.exists() {
            if level == Level::L4 && self.cfg.keep_l4 {
                let archive = self.paths.archive_dir(&format!("{}", unix_seconds()));
                fs::create_dir_all(&archive)?;
                fs::rename(&old_file, archive.join(ckpt_file_name(rank, old)))?;
            } else {
                let _ = fs::remove_file(&old_file);
            }
        }
        if level == Level::L3 {
            let _ = fs::remove_file(self.paths.rs_file(rank, old));
        }
        Ok(())
    }

    fn relative_local(&self, path: &Path) -> String {
        path.strip_prefix(&self.paths.local)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    // ------------------------------------------------------------------
    // Snapshot scheduling
    // ------------------------------------------------------------------

    /// Checkpoint when an interval-scheduled level is due.
    ///
    /// Wall-clock minutes are agreed across ranks at a widening resync
    /// interval so every rank takes the same decision.
    pub fn snapshot(&mut self) -> Result<StatusToken> {
        self.iter_count += 1;
        if self.iter_count % self.sync_interval == 0 {
            let minute = (self.started.elapsed().as_secs() / 60) as u32;
            let minutes = stratum_comm::allgather_u64(self.app.as_ref(), u64::from(minute))?;
            self.synced_minute = minutes.iter().copied().min().unwrap_or(0) as u32;
            if self.sync_interval < u64::from(self.cfg.max_sync_interval) {
                self.sync_interval *= 2;
            }
        }
        if let Some(level) = self.sched.due(&self.cfg, self.synced_minute) {
            let cid = self.next_cid;
            return self.checkpoint(cid, level);
        }
        Ok(StatusToken::Sces)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Restore every protected variable from the cheapest intact level.
    pub fn recover(&mut self) -> Result<StatusToken> {
        let outcome = {
            let ctx = RecoveryCtx {
                cfg: &self.cfg,
                topo: &self.topo,
                paths: &self.paths,
                app: self.app.as_ref(),
                group: self.group.as_ref(),
            };
            recover::run(&ctx)?
        };

        let mut sizes = Vec::with_capacity(outcome.vars.len());
        for (id, bytes) in &outcome.vars {
            match self.registry.get(*id) {
                Ok(var) => {
                    if var.byte_size() != bytes.len() as u64 {
                        return Err(StratumError::config(format!(
                            "variable {id} was stored with {} bytes but is protected with {}",
                            bytes.len(),
                            var.byte_size()
                        )));
                    }
                    var.buffer.write().copy_from_slice(bytes);
                }
                Err(_) => {
                    warn!(%id, "stored variable is not protected, skipping");
                    continue;
                }
            }
            sizes.push((*id, bytes.len() as u64));
        }
        self.registry.set_stored_sizes(&sizes);
        self.committed_vars = sizes.iter().map(|&(id, _)| id).collect();
        self.chain = outcome.chain.unwrap_or_default();
        self.level_last_cid[outcome.level.index()] = Some(outcome.cid);
        self.last_ckpt = Some((outcome.cid, outcome.level));
        self.next_cid = outcome.cid + 1;
        self.restart = false;
        info!(level = %outcome.level, cid = outcome.cid, "recovery complete");
        Ok(StatusToken::Sces)
    }

    /// Restore a single variable from the last committed checkpoint,
    /// without any communication.
    pub fn recover_var(&mut self, id: VarId) -> Result<()> {
        let rank = self.topo.my_rank;
        for level in [Level::L1, Level::L2, Level::L3] {
            let Ok(sidecar) = LevelMeta::load(&self.paths.sidecar_file(level, rank)) else {
                continue;
            };
            let file = self.paths.local.join(&sidecar.ckpt_file);
            let Ok(reader) = stratum_format::ContainerReader::load(&file) else {
                continue;
            };
            let Ok(bytes) = reader.var_bytes(id) else {
                continue;
            };
            return self.write_recovered_var(id, &bytes);
        }
        let Ok(sidecar) = LevelMeta::load(&self.paths.sidecar_file(Level::L4, rank)) else {
            return Err(StratumError::UnknownVariable { id: id.get() });
        };
        let file = self.paths.global.join(&sidecar.ckpt_file);
        let bytes = if self.cfg.inline_level[Level::L4.index()] {
            PosixWriter::new().recover_var(&file, &sidecar.vars, id)?
        } else {
            stratum_format::ContainerReader::load(&file)?.var_bytes(id)?
        };
        self.write_recovered_var(id, &bytes)
    }

    fn write_recovered_var(&mut self, id: VarId, bytes: &[u8]) -> Result<()> {
        let var = self.registry.get(id)?;
        if var.byte_size() != bytes.len() as u64 {
            return Err(StratumError::config(format!(
                "variable {id} was stored with {} bytes but is protected with {}",
                bytes.len(),
                var.byte_size()
            )));
        }
        var.buffer.write().copy_from_slice(bytes);
        self.registry.set_stored_sizes(&[(id, bytes.len() as u64)]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Incremental checkpoints
    // ------------------------------------------------------------------

    /// Begin an incremental checkpoint. With `activate == false` this is a
    /// no-op, mirroring a disabled call site.
    pub fn init_icp(&mut self, cid: CkptId, level: Level, activate: bool) -> Result<StatusToken> {
        if !activate {
            return Ok(StatusToken::Sces);
        }
        if self.icp.is_some() {
            warn!("incremental checkpoint already active");
            return Ok(StatusToken::Nscs);
        }
        if let Err(err) = self.drain_pending_ack() {
            warn!(error = %err, "previous offloaded checkpoint failed");
        }
        if level == Level::L4 && !self.cfg.inline_level[Level::L4.index()] {
            warn!("incremental checkpoints require an inline L4 flush");
            return Ok(StatusToken::Nscs);
        }
        self.registry.stage_device_vars(self.stager.as_deref())?;

        let write = if level == Level::L4 && self.cfg.inline_level[Level::L4.index()] {
            let mut writer = writer_for(self.cfg.io_mode)?;
            let dst = self.paths.ckpt_file(Level::L4, self.topo.my_rank, cid);
            let tmp = self.paths.tmp_for(Level::L4, &dst);
            writer.open(&dst, &tmp)?;
            IcpWrite::Posix { writer, tmp }
        } else {
            IcpWrite::Staged {
                snapshots: Vec::new(),
            }
        };
        self.icp = Some(IcpState {
            cid,
            level,
            added: Vec::new(),
            failed: false,
            write,
        });
        Ok(StatusToken::Sces)
    }

    /// Add one protected variable to the active incremental checkpoint.
    pub fn add_var_icp(&mut self, id: VarId) -> Result<StatusToken> {
        let Some(icp) = self.icp.as_mut() else {
            warn!("add_var_icp without an active incremental checkpoint");
            return Ok(StatusToken::Nscs);
        };
        if icp.added.contains(&id) {
            return Ok(StatusToken::Sces);
        }
        let var = match self.registry.get(id) {
            Ok(var) => var,
            Err(err) => {
                warn!(%id, error = %err, "unknown variable in incremental checkpoint");
                icp.failed = true;
                return Ok(StatusToken::Nscs);
            }
        };
        let outcome = match &mut icp.write {
            IcpWrite::Posix { writer, .. } => writer.write_var(id, &var.buffer.read()),
            IcpWrite::Staged { snapshots } => {
                snapshots.push((id, var.buffer.read().clone()));
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {
                icp.added.push(id);
                Ok(StatusToken::Sces)
            }
            Err(err) => {
                warn!(%id, error = %err, "incremental write failed");
                icp.failed = true;
                Ok(StatusToken::Nscs)
            }
        }
    }

    /// Commit (or roll back) the active incremental checkpoint.
    pub fn finalize_icp(&mut self) -> Result<StatusToken> {
        let Some(icp) = self.icp.take() else {
            warn!("finalize_icp without an active incremental checkpoint");
            return Ok(StatusToken::Nscs);
        };
        if icp.failed {
            Self::rollback_icp(&icp);
            return Err(StratumError::IcpAborted {
                detail: "a variable failed to write".to_owned(),
            });
        }
        for committed in &self.committed_vars {
            if !icp.added.contains(committed) {
                Self::rollback_icp(&icp);
                return Err(StratumError::VariableMissing {
                    id: committed.get(),
                });
            }
        }

        let sizes: Vec<(VarId, u64)> = icp
            .added
            .iter()
            .map(|&id| self.registry.get(id).map(|var| (id, var.byte_size())))
            .collect::<Result<_>>()?;

        match icp.write {
            IcpWrite::Posix { mut writer, .. } => {
                let receipt = writer.finalize()?;
                self.app.barrier()?;
                let meta = LevelMeta {
                    ckpt_file: format!(
                        "{}/{}",
                        Level::L4.dir_name(),
                        ckpt_file_name(self.topo.my_rank, icp.cid)
                    ),
                    ckpt_id: icp.cid,
                    fs: receipt.fs,
                    max_fs: receipt.fs,
                    pfs: 0,
                    checksum: hex_string(&receipt.digest),
                    ptner_checksum: None,
                    rs_checksum: None,
                    vars: receipt.vars.clone(),
                };
                meta.store(&self.paths.sidecar_file(Level::L4, self.topo.my_rank))?;
                self.app.barrier()?;
                let previous = self.level_last_cid[Level::L4.index()];
                self.commit_state(icp.cid, Level::L4, &receipt.vars);
                self.retention(Level::L4, previous, icp.cid)?;
            }
            IcpWrite::Staged { snapshots } => {
                let summary = {
                    let refs: Vec<VarSnapshot<'_>> = snapshots
                        .iter()
                        .enumerate()
                        .map(|(index, (id, bytes))| VarSnapshot {
                            id: *id,
                            idx: index as u32,
                            bytes,
                        })
                        .collect();
                    self.write_local_container(icp.cid, icp.level, &refs)?
                };
                self.inline_post_process(icp.cid, icp.level, summary, &sizes)?;
            }
        }
        self.next_cid = self.next_cid.max(icp.cid + 1);
        Ok(StatusToken::Sces)
    }

    fn rollback_icp(icp: &IcpState) {
        if let IcpWrite::Posix { tmp, .. } = &icp.write {
            let _ = fs::remove_file(tmp);
        }
        warn!(cid = icp.cid, "incremental checkpoint rolled back");
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Enqueue a file transfer to the staging target.
    pub fn stage(&mut self, local: &Path, remote: &Path) -> Result<StageId> {
        if !self.cfg.enable_staging {
            return Err(StratumError::config("staging is disabled"));
        }
        let id = self.stage_table.allocate()?;
        if let Some(head) = self.topo.head_rank {
            let request = StageRequest {
                id: id.0,
                local: local.to_path_buf(),
                remote: remote.to_path_buf(),
            };
            self.global
                .send(head, self.cfg.stage_tag, &request.encode())?;
        } else {
            let resolved = resolve_remote(&self.paths.stage, remote);
            let state = match perform_stage(local, &resolved) {
                Ok(()) => StageState::Success,
                Err(err) => {
                    warn!(error = %err, "inline staging failed");
                    StageState::Failed
                }
            };
            self.stage_table.update(id, state);
        }
        Ok(id)
    }

    /// Current state of a staging request, draining pending updates.
    pub fn stage_status(&mut self, id: StageId) -> StageState {
        while let Ok(Some((_, _, payload))) = self.global.try_recv_any(&[self.cfg.stage_tag]) {
            match decode_stage_ack(&payload) {
                Ok((ack_id, state)) => self.stage_table.update(StageId(ack_id), state),
                Err(err) => warn!(error = %err, "undecodable stage ack"),
            }
        }
        self.stage_table.status(id)
    }

    // ------------------------------------------------------------------
    // Finalize
    // ------------------------------------------------------------------

    /// Flush pending work, release the heads, and persist the clean-exit
    /// marker (unless the last checkpoint is kept for a warm restart).
    pub fn finalize(&mut self) -> Result<StatusToken> {
        if self.finalized {
            return Ok(StatusToken::Sces);
        }
        if let Some(icp) = self.icp.take() {
            Self::rollback_icp(&icp);
        }
        if let Err(err) = self.drain_pending_ack() {
            warn!(error = %err, "offloaded checkpoint unfinished at finalize");
        }
        self.app.barrier()?;
        if let Some(head) = self.topo.head_rank {
            self.global.send(head, self.cfg.final_tag, &[])?;
        }
        if self.app.rank() == 0 {
            RestartRecord {
                failure: self.cfg.keep_last_ckpt,
                exec_id: self.exec_id.clone(),
            }
            .store(&self.paths.restart_record)?;
        }
        self.app.barrier()?;
        if !self.cfg.keep_last_ckpt && self.topo.node_rank == self.topo.nb_heads {
            let _ = fs::remove_dir_all(&self.paths.local);
        }
        self.finalized = true;
        info!(exec_id = %self.exec_id, "engine finalized");
        Ok(StatusToken::Sces)
    }
}

struct LocalWrite {
    path: PathBuf,
    fs: u64,
    checksum_hex: String,
    checksum_raw: [u8; 16],
}

fn hex_to_raw(hex: &[u8; 32]) -> [u8; 16] {
    fn nibble(byte: u8) -> u8 {
        match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => 0,
        }
    }
    let mut raw = [0_u8; 16];
    for (index, pair) in hex.chunks(2).enumerate() {
        raw[index] = (nibble(pair[0]) << 4) | nibble(pair[1]);
    }
    raw
}
