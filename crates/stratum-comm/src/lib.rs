//! Message-passing seam between the engine and its transport.
//!
//! Every collective and point-to-point operation the engine performs goes
//! through [`Communicator`]. Production deployments bind this to their MPI
//! (or equivalent) launcher glue; tests and single-node runs use
//! [`LocalComm`], which runs a whole cluster as threads inside one process
//! with deterministic delivery.
//!
//! Ranks in this API are always communicator-local. Tags partition traffic
//! classes (checkpoint, staging, finalize, general) so concurrent protocols
//! never cross-talk.

mod local;

pub use local::{LocalCluster, LocalComm};

use stratum_error::Result;

/// Transport operations required by the checkpoint engine.
///
/// All collectives are program-ordered per rank: every member of a
/// communicator issues the same sequence of collective calls.
pub trait Communicator: Send + Sync {
    /// My rank within this communicator.
    fn rank(&self) -> u32;

    /// Number of ranks in this communicator.
    fn size(&self) -> u32;

    /// Block until every member has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Send `payload` to `dest`. Buffered; never blocks on the receiver.
    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<()>;

    /// Receive the next message from `source` carrying `tag`.
    fn recv(&self, source: u32, tag: i32) -> Result<Vec<u8>>;

    /// Paired exchange with `peer`: send `payload`, return the peer's.
    fn sendrecv(&self, peer: u32, tag: i32, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(peer, tag, payload)?;
        self.recv(peer, tag)
    }

    /// Receive the next message carrying any of `tags`, from any member.
    /// Returns `(source, tag, payload)`.
    fn recv_any(&self, tags: &[i32]) -> Result<(u32, i32, Vec<u8>)>;

    /// Non-blocking variant of [`Communicator::recv_any`].
    fn try_recv_any(&self, tags: &[i32]) -> Result<Option<(u32, i32, Vec<u8>)>>;

    /// Gather every member's payload, ordered by rank.
    fn allgather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Distribute `root`'s payload to every member.
    fn broadcast(&self, root: u32, payload: &[u8]) -> Result<Vec<u8>>;

    /// Partition members by `color`; members of the same color form a new
    /// communicator ordered by `(key, old rank)`. Collective.
    fn split(&self, color: u32, key: u32) -> Result<Box<dyn Communicator>>;
}

/// Allgather of one little-endian `u64` per rank; a common coordination
/// shape (file sizes, capability masks, vote words).
pub fn allgather_u64(comm: &dyn Communicator, value: u64) -> Result<Vec<u64>> {
    let gathered = comm.allgather(&value.to_le_bytes())?;
    gathered
        .into_iter()
        .map(|bytes| {
            let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                stratum_error::StratumError::CommFailure {
                    detail: format!("allgather_u64 expects 8-byte payloads, got {}", bytes.len()),
                }
            })?;
            Ok(u64::from_le_bytes(raw))
        })
        .collect()
}
