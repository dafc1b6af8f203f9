//! In-process cluster transport.
//!
//! [`LocalCluster::new`] spins up `n` endpoints; each [`LocalComm`] is one
//! rank's handle, meant to be moved onto that rank's thread. Delivery is
//! per-sender FIFO. Sub-communicators share their rank's endpoint and are
//! disambiguated by a context id derived deterministically on every member.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use stratum_error::{Result, StratumError};
use tracing::trace;

use crate::Communicator;

/// Tag reserved for allgather/barrier traffic.
const TAG_COLLECTIVE: i32 = i32::MIN + 1;
/// Tag reserved for broadcast traffic.
const TAG_BCAST: i32 = i32::MIN + 2;

/// How long a blocked receive waits before declaring the peer lost.
const RECV_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Envelope {
    ctx: u64,
    src_global: u32,
    tag: i32,
    payload: Vec<u8>,
}

/// One rank's inbox: the channel plus a stash for messages received while
/// waiting for a different match.
#[derive(Debug)]
struct Endpoint {
    rx: Receiver<Envelope>,
    stash: Mutex<VecDeque<Envelope>>,
}

#[derive(Debug)]
struct ClusterShared {
    senders: Vec<Sender<Envelope>>,
}

/// Factory for the endpoints of an in-process cluster.
#[derive(Debug)]
pub struct LocalCluster;

impl LocalCluster {
    /// Create `size` connected endpoints, one per rank.
    #[must_use]
    pub fn new(size: u32) -> Vec<LocalComm> {
        let mut senders = Vec::with_capacity(size as usize);
        let mut receivers = Vec::with_capacity(size as usize);
        for _ in 0..size {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let shared = Arc::new(ClusterShared { senders });
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, rx)| LocalComm {
                shared: Arc::clone(&shared),
                endpoint: Arc::new(Endpoint {
                    rx,
                    stash: Mutex::new(VecDeque::new()),
                }),
                ctx: 0,
                members: (0..size).collect(),
                my_local: rank as u32,
                split_seq: Mutex::new(0),
            })
            .collect()
    }
}

/// One rank's handle onto the in-process cluster.
#[derive(Debug)]
pub struct LocalComm {
    shared: Arc<ClusterShared>,
    endpoint: Arc<Endpoint>,
    ctx: u64,
    /// Global ranks of this communicator's members, by local rank.
    members: Vec<u32>,
    my_local: u32,
    /// Collective split calls performed on this communicator so far.
    /// Identical on every member because splits are collective.
    split_seq: Mutex<u64>,
}

impl LocalComm {
    fn my_global(&self) -> u32 {
        self.members[self.my_local as usize]
    }

    fn global_of(&self, local: u32) -> Result<u32> {
        self.members
            .get(local as usize)
            .copied()
            .ok_or_else(|| StratumError::CommFailure {
                detail: format!(
                    "rank {local} outside communicator of size {}",
                    self.members.len()
                ),
            })
    }

    fn local_of(&self, global: u32) -> Option<u32> {
        self.members
            .iter()
            .position(|&member| member == global)
            .map(|index| index as u32)
    }

    fn push(&self, dest_global: u32, tag: i32, payload: Vec<u8>) -> Result<()> {
        let envelope = Envelope {
            ctx: self.ctx,
            src_global: self.my_global(),
            tag,
            payload,
        };
        self.shared.senders[dest_global as usize]
            .send(envelope)
            .map_err(|_| StratumError::CommFailure {
                detail: format!("endpoint {dest_global} is gone"),
            })
    }

    /// Take the first stashed or incoming envelope accepted by `matches`.
    fn take_matching<F>(&self, matches: F) -> Result<Envelope>
    where
        F: Fn(&Envelope) -> bool,
    {
        {
            let mut stash = self.endpoint.stash.lock();
            if let Some(index) = stash.iter().position(&matches) {
                return Ok(stash.remove(index).expect("index just found"));
            }
        }
        loop {
            let envelope = self
                .endpoint
                .rx
                .recv_timeout(RECV_DEADLINE)
                .map_err(|_| StratumError::CommFailure {
                    detail: format!(
                        "rank {} timed out waiting for a message",
                        self.my_global()
                    ),
                })?;
            if matches(&envelope) {
                return Ok(envelope);
            }
            self.endpoint.stash.lock().push_back(envelope);
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> u32 {
        self.my_local
    }

    fn size(&self) -> u32 {
        self.members.len() as u32
    }

    fn barrier(&self) -> Result<()> {
        self.allgather(&[])?;
        Ok(())
    }

    fn send(&self, dest: u32, tag: i32, payload: &[u8]) -> Result<()> {
        let dest_global = self.global_of(dest)?;
        trace!(
            src = self.my_local,
            dest, tag, bytes = payload.len(), "send"
        );
        self.push(dest_global, tag, payload.to_vec())
    }

    fn recv(&self, source: u32, tag: i32) -> Result<Vec<u8>> {
        let src_global = self.global_of(source)?;
        let ctx = self.ctx;
        let envelope = self.take_matching(|env| {
            env.ctx == ctx && env.src_global == src_global && env.tag == tag
        })?;
        Ok(envelope.payload)
    }

    fn recv_any(&self, tags: &[i32]) -> Result<(u32, i32, Vec<u8>)> {
        let ctx = self.ctx;
        let envelope =
            self.take_matching(|env| env.ctx == ctx && tags.contains(&env.tag))?;
        let source = self.local_of(envelope.src_global).ok_or_else(|| {
            StratumError::CommFailure {
                detail: format!("message from rank {} outside communicator", envelope.src_global),
            }
        })?;
        Ok((source, envelope.tag, envelope.payload))
    }

    fn try_recv_any(&self, tags: &[i32]) -> Result<Option<(u32, i32, Vec<u8>)>> {
        let ctx = self.ctx;
        let matches = |env: &Envelope| env.ctx == ctx && tags.contains(&env.tag);
        let envelope = {
            let mut stash = self.endpoint.stash.lock();
            if let Some(index) = stash.iter().position(|env| matches(env)) {
                stash.remove(index)
            } else {
                let mut found = None;
                while let Ok(env) = self.endpoint.rx.try_recv() {
                    if found.is_none() && matches(&env) {
                        found = Some(env);
                    } else {
                        stash.push_back(env);
                    }
                }
                found
            }
        };
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let source = self.local_of(envelope.src_global).ok_or_else(|| {
            StratumError::CommFailure {
                detail: format!("message from rank {} outside communicator", envelope.src_global),
            }
        })?;
        Ok(Some((source, envelope.tag, envelope.payload)))
    }

    fn allgather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>> {
        // Buffered sends first, then drain: no deadlock even though every
        // member runs the same sequence.
        for local in 0..self.size() {
            if local != self.my_local {
                self.send(local, TAG_COLLECTIVE, payload)?;
            }
        }
        let mut gathered = Vec::with_capacity(self.size() as usize);
        for local in 0..self.size() {
            if local == self.my_local {
                gathered.push(payload.to_vec());
            } else {
                gathered.push(self.recv(local, TAG_COLLECTIVE)?);
            }
        }
        Ok(gathered)
    }

    fn broadcast(&self, root: u32, payload: &[u8]) -> Result<Vec<u8>> {
        if root >= self.size() {
            return Err(StratumError::CommFailure {
                detail: format!("broadcast root {root} outside communicator"),
            });
        }
        if self.my_local == root {
            for local in 0..self.size() {
                if local != root {
                    self.send(local, TAG_BCAST, payload)?;
                }
            }
            Ok(payload.to_vec())
        } else {
            self.recv(root, TAG_BCAST)
        }
    }

    fn split(&self, color: u32, key: u32) -> Result<Box<dyn Communicator>> {
        let mut record = [0_u8; 8];
        record[..4].copy_from_slice(&color.to_le_bytes());
        record[4..].copy_from_slice(&key.to_le_bytes());
        let gathered = self.allgather(&record)?;

        let seq = {
            let mut guard = self.split_seq.lock();
            *guard += 1;
            *guard
        };
        // FNV-style mix; every member of the parent computes the same value
        // for the same (parent ctx, split number, color).
        let ctx = self
            .ctx
            .wrapping_mul(0x0000_0100_0000_01B3)
            .wrapping_add(seq << 32)
            .wrapping_add(u64::from(color));

        let mut colored: Vec<(u32, u32, u32)> = Vec::new();
        for (old_local, bytes) in gathered.iter().enumerate() {
            let raw: [u8; 8] =
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StratumError::CommFailure {
                        detail: "malformed split record".to_owned(),
                    })?;
            let member_color = u32::from_le_bytes(raw[..4].try_into().expect("4-byte slice"));
            let member_key = u32::from_le_bytes(raw[4..].try_into().expect("4-byte slice"));
            if member_color == color {
                colored.push((member_key, old_local as u32, self.members[old_local]));
            }
        }
        colored.sort_unstable();
        let members: Vec<u32> = colored.iter().map(|&(_, _, global)| global).collect();
        let my_local = colored
            .iter()
            .position(|&(_, old_local, _)| old_local == self.my_local)
            .ok_or_else(|| StratumError::internal("split lost the calling rank"))?
            as u32;

        Ok(Box::new(Self {
            shared: Arc::clone(&self.shared),
            endpoint: Arc::clone(&self.endpoint),
            ctx,
            members,
            my_local,
            split_seq: Mutex::new(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Run `body` on every rank of a fresh cluster and join.
    fn on_cluster<F>(size: u32, body: F)
    where
        F: Fn(LocalComm) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        let handles: Vec<_> = LocalCluster::new(size)
            .into_iter()
            .map(|comm| {
                let body = Arc::clone(&body);
                thread::spawn(move || body(comm))
            })
            .collect();
        for handle in handles {
            handle.join().expect("rank thread panicked");
        }
    }

    #[test]
    fn test_point_to_point_round_trip() {
        on_cluster(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 7, b"ping").unwrap();
                assert_eq!(comm.recv(1, 7).unwrap(), b"pong");
            } else {
                assert_eq!(comm.recv(0, 7).unwrap(), b"ping");
                comm.send(0, 7, b"pong").unwrap();
            }
        });
    }

    #[test]
    fn test_tag_selective_delivery() {
        on_cluster(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, 1, b"first-tag").unwrap();
                comm.send(1, 2, b"second-tag").unwrap();
            } else {
                // Receive in reverse send order; tag matching must hold.
                assert_eq!(comm.recv(0, 2).unwrap(), b"second-tag");
                assert_eq!(comm.recv(0, 1).unwrap(), b"first-tag");
            }
        });
    }

    #[test]
    fn test_sendrecv_pairs_do_not_deadlock() {
        on_cluster(2, |comm| {
            let peer = 1 - comm.rank();
            let mine = vec![comm.rank() as u8; 16];
            let theirs = comm.sendrecv(peer, 9, &mine).unwrap();
            assert_eq!(theirs, vec![peer as u8; 16]);
        });
    }

    #[test]
    fn test_allgather_orders_by_rank() {
        on_cluster(4, |comm| {
            let gathered = comm.allgather(&[comm.rank() as u8]).unwrap();
            assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);
        });
    }

    #[test]
    fn test_broadcast_from_nonzero_root() {
        on_cluster(3, |comm| {
            let payload = if comm.rank() == 2 { b"root".to_vec() } else { Vec::new() };
            let result = comm.broadcast(2, &payload).unwrap();
            assert_eq!(result, b"root");
        });
    }

    #[test]
    fn test_barrier_completes_on_all_ranks() {
        on_cluster(4, |comm| {
            for _ in 0..3 {
                comm.barrier().unwrap();
            }
        });
    }

    #[test]
    fn test_split_by_parity() {
        on_cluster(4, |comm| {
            let color = comm.rank() % 2;
            let sub = comm.split(color, comm.rank()).unwrap();
            assert_eq!(sub.size(), 2);
            assert_eq!(sub.rank(), comm.rank() / 2);

            // Exchange inside the sub-communicator only.
            let gathered = sub.allgather(&[comm.rank() as u8]).unwrap();
            let expected: Vec<Vec<u8>> = if color == 0 {
                vec![vec![0], vec![2]]
            } else {
                vec![vec![1], vec![3]]
            };
            assert_eq!(gathered, expected);
        });
    }

    #[test]
    fn test_split_traffic_does_not_leak_to_parent() {
        on_cluster(2, |comm| {
            let sub = comm.split(0, comm.rank()).unwrap();
            if comm.rank() == 0 {
                sub.send(1, 5, b"sub").unwrap();
                comm.send(1, 5, b"parent").unwrap();
            } else {
                // Parent recv must not consume the sub-communicator message.
                assert_eq!(comm.recv(0, 5).unwrap(), b"parent");
                assert_eq!(sub.recv(0, 5).unwrap(), b"sub");
            }
        });
    }

    #[test]
    fn test_recv_any_reports_source_and_tag() {
        on_cluster(3, |comm| {
            if comm.rank() == 0 {
                let (src, tag, payload) = comm.recv_any(&[41, 42]).unwrap();
                assert!(src == 1 || src == 2);
                assert_eq!(tag as u32, 40 + src);
                assert_eq!(payload, vec![src as u8]);
                let (src2, _, _) = comm.recv_any(&[41, 42]).unwrap();
                assert_ne!(src, src2);
            } else {
                comm.send(0, 40 + comm.rank() as i32, &[comm.rank() as u8])
                    .unwrap();
            }
        });
    }

    #[test]
    fn test_try_recv_any_does_not_block() {
        on_cluster(2, |comm| {
            if comm.rank() == 0 {
                assert!(comm.try_recv_any(&[3]).unwrap().is_none());
                comm.send(1, 99, b"go").unwrap();
                // Wait for the reply without blocking forever.
                loop {
                    if let Some((src, tag, payload)) = comm.try_recv_any(&[3]).unwrap() {
                        assert_eq!((src, tag), (1, 3));
                        assert_eq!(payload, b"done");
                        break;
                    }
                    thread::yield_now();
                }
            } else {
                comm.recv(0, 99).unwrap();
                comm.send(0, 3, b"done").unwrap();
            }
        });
    }

    #[test]
    fn test_allgather_u64_helper() {
        on_cluster(3, |comm| {
            let sizes = crate::allgather_u64(&comm, u64::from(comm.rank()) * 100).unwrap();
            assert_eq!(sizes, vec![0, 100, 200]);
        });
    }
}
