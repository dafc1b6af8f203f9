//! Core checkpoint engine: variable registry, level orchestration,
//! recovery planning, head offloading, staging and incremental
//! checkpoints.
//!
//! The crate exposes one entry point, [`Engine::init`], which returns a
//! live engine on application ranks and runs the head loop to completion
//! on dedicated head processes.

pub mod engine;
pub mod head;
pub mod paths;
pub mod recover;
pub mod registry;
pub mod sidecar;
pub mod snapshot;
pub mod stage;

pub use engine::{Engine, EngineStatus, InitOutcome};
pub use paths::ExecPaths;
pub use recover::{RecoveryOutcome, RecoveryStage};
pub use registry::{DataRegistry, ProtectedVar};
pub use sidecar::{LevelMeta, RestartRecord};
pub use stage::{SI_MAX_NUM, StageId};
