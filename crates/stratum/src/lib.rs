//! Multi-level checkpoint/restart for parallel applications.
//!
//! Application processes register in-memory variables with the engine;
//! the engine periodically snapshots them to a hierarchy of storage tiers
//! (node-local copy, partner copy, Reed-Solomon encoded group, parallel
//! filesystem) and reconstructs them from the cheapest intact tier on
//! restart.
//!
//! ```no_run
//! use stratum::{Config, Engine, InitOutcome, Level, LocalCluster, PrimitiveType, ProtectedBuffer, VarId};
//!
//! # fn main() -> stratum::Result<()> {
//! let mut comms = LocalCluster::new(1);
//! let outcome = Engine::init(Config::default(), Box::new(comms.remove(0)))?;
//! let InitOutcome::App(mut engine) = outcome else { return Ok(()) };
//!
//! let state = ProtectedBuffer::zeroed(1 << 20);
//! engine.protect(VarId(0), &state, 1 << 20, PrimitiveType::Char.type_id())?;
//! if engine.is_restart() {
//!     engine.recover()?;
//! }
//! engine.checkpoint(1, Level::L1)?;
//! engine.finalize()?;
//! # Ok(())
//! # }
//! ```

pub use stratum_comm::{Communicator, LocalCluster, LocalComm};
pub use stratum_core::{
    Engine, EngineStatus, InitOutcome, LevelMeta, RestartRecord, StageId,
};
pub use stratum_encode::{PARITY_SHARDS, RsCode};
pub use stratum_error::{Result, StratumError};
pub use stratum_format::{ContainerReader, F_DB, F_DBVAR, F_META};
pub use stratum_types::{
    CompositeType, Config, DcpMode, DeviceStager, Level, Placement, PrimitiveType,
    ProtectedBuffer, SerializerKind, StageState, StatusToken, Topology, TypeField, TypeId, VarId,
};

/// Suggested `tracing_subscriber` filter directive for a configured
/// verbosity level (1 debug, 2 info, 3 warnings only).
#[must_use]
pub fn filter_for_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        1 => "stratum=debug",
        2 => "stratum=info",
        _ => "stratum=warn",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_record_sizes_are_exported() {
        // External tooling decodes the container with these constants.
        assert_eq!(F_META, 116);
        assert_eq!(F_DB, 28);
        assert_eq!(F_DBVAR, 78);
    }

    #[test]
    fn test_filter_for_verbosity() {
        assert_eq!(filter_for_verbosity(1), "stratum=debug");
        assert_eq!(filter_for_verbosity(3), "stratum=warn");
    }
}
