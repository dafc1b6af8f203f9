//! L2 partner copy: ring exchange of committed checkpoint files.
//!
//! Every application rank streams its local file to the peer on its right
//! ring neighbor while storing the file arriving from its left neighbor.
//! The stored copy commits by rename; any transport or disk error deletes
//! the partial copy so the level can be marked failed without leaving a
//! plausible-looking file behind.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use md5::{Digest, Md5};
use stratum_comm::Communicator;
use stratum_error::{Result, StratumError};
use tracing::{debug, warn};

/// Outcome of a successful partner exchange.
#[derive(Debug, Clone, Copy)]
pub struct PartnerCopy {
    /// Size of the partner file now stored on this rank.
    pub pt_fs: u64,
    /// MD5 of the stored partner file.
    pub digest: [u8; 16],
}

/// Exchange checkpoint files around the group ring.
///
/// `holder` receives this rank's file; `owner` is the rank whose file this
/// rank stores. Both are ranks in `comm`. The two transfers are interleaved
/// chunk by chunk so memory stays bounded by `block_size`.
pub fn exchange_partner(
    comm: &dyn Communicator,
    holder: u32,
    owner: u32,
    tag: i32,
    my_file: &Path,
    partner_file: &Path,
    partner_tmp: &Path,
    block_size: usize,
) -> Result<PartnerCopy> {
    if comm.size() < 2 || holder == comm.rank() || owner == comm.rank() {
        return Err(StratumError::config(
            "partner copy needs at least two ranks in the ring",
        ));
    }

    let outcome = stream_exchange(
        comm,
        holder,
        owner,
        tag,
        my_file,
        partner_tmp,
        block_size,
    );
    match outcome {
        Ok(copy) => {
            fs::rename(partner_tmp, partner_file)?;
            debug!(
                owner,
                pt_fs = copy.pt_fs,
                file = %partner_file.display(),
                "partner copy stored"
            );
            Ok(copy)
        }
        Err(err) => {
            // Leave no partial copy behind; the level is failed on this rank.
            let _ = fs::remove_file(partner_tmp);
            let _ = fs::remove_file(partner_file);
            warn!(owner, error = %err, "partner exchange failed");
            Err(err)
        }
    }
}

fn stream_exchange(
    comm: &dyn Communicator,
    holder: u32,
    owner: u32,
    tag: i32,
    my_file: &Path,
    partner_tmp: &Path,
    block_size: usize,
) -> Result<PartnerCopy> {
    let mut src = File::open(my_file)?;
    let my_fs = src.metadata()?.len();

    comm.send(holder, tag, &my_fs.to_le_bytes())?;
    let owner_bytes = comm.recv(owner, tag)?;
    let raw: [u8; 8] = owner_bytes
        .as_slice()
        .try_into()
        .map_err(|_| StratumError::CommFailure {
            detail: "partner size message must be 8 bytes".to_owned(),
        })?;
    let owner_fs = u64::from_le_bytes(raw);

    let mut dst = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(partner_tmp)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; block_size];

    let send_chunks = my_fs.div_ceil(block_size as u64);
    let recv_chunks = owner_fs.div_ceil(block_size as u64);
    let rounds = send_chunks.max(recv_chunks);

    let mut sent = 0_u64;
    let mut received = 0_u64;
    for _ in 0..rounds {
        if sent < my_fs {
            let len = ((my_fs - sent) as usize).min(block_size);
            src.read_exact(&mut buffer[..len])?;
            comm.send(holder, tag, &buffer[..len])?;
            sent += len as u64;
        }
        if received < owner_fs {
            let chunk = comm.recv(owner, tag)?;
            let expected = ((owner_fs - received) as usize).min(block_size);
            if chunk.len() != expected {
                return Err(StratumError::CommFailure {
                    detail: format!(
                        "partner chunk of {} bytes, expected {expected}",
                        chunk.len()
                    ),
                });
            }
            hasher.update(&chunk);
            dst.write_all(&chunk)?;
            received += chunk.len() as u64;
        }
    }
    dst.sync_all()?;
    Ok(PartnerCopy {
        pt_fs: owner_fs,
        digest: hasher.finalize().into(),
    })
}
