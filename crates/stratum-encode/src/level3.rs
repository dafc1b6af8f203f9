//! L3 group encoding: Reed-Solomon parity over the checkpoint files of one
//! group, streamed stripe by stripe.
//!
//! Every member contributes its committed checkpoint file as one data
//! shard, zero-padded to the group's `max_fs`. The first
//! [`PARITY_SHARDS`](crate::rs::PARITY_SHARDS) ring positions persist one
//! parity fragment each. Decoding reverses the flow: survivors stream
//! their shards and every rank missing its data rebuilds it locally from
//! the same decode matrix.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use md5::{Digest, Md5};
use stratum_comm::{Communicator, allgather_u64};
use stratum_error::{Result, StratumError};
use tracing::{debug, info};

use crate::galois::WORD_BYTES;
use crate::rs::{PARITY_SHARDS, RsCode};

/// Outcome of a group encode on one rank.
#[derive(Debug, Clone, Copy)]
pub struct GroupEncode {
    /// Padded shard size used for the encoding.
    pub max_fs: u64,
    /// Set when this rank persisted a parity fragment.
    pub parity: Option<ParityFragment>,
}

/// A persisted parity fragment.
#[derive(Debug, Clone, Copy)]
pub struct ParityFragment {
    pub size: u64,
    pub digest: [u8; 16],
}

/// Inputs for [`decode_group`].
#[derive(Debug)]
pub struct GroupDecode<'a> {
    /// This rank's surviving (verified) data file, if any.
    pub my_data: Option<&'a Path>,
    /// This rank's surviving (verified) parity fragment, if any.
    pub my_parity: Option<&'a Path>,
    /// Padded shard size recorded by the encode.
    pub max_fs: u64,
    /// Unpadded size of this rank's original file.
    pub my_fs: u64,
    /// Where to rebuild this rank's data file.
    pub out_path: &'a Path,
    pub out_tmp: &'a Path,
    /// Streaming stripe size in bytes.
    pub stripe_size: usize,
}

fn read_stripe(file: &mut File, file_len: u64, offset: u64, stripe: &mut [u8]) -> Result<()> {
    stripe.fill(0);
    if offset >= file_len {
        return Ok(());
    }
    let available = ((file_len - offset) as usize).min(stripe.len());
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut stripe[..available])?;
    Ok(())
}

/// Encode the group's parity fragments. Collective over `comm`.
pub fn encode_group(
    comm: &dyn Communicator,
    my_file: &Path,
    parity_path: &Path,
    parity_tmp: &Path,
    stripe_size: usize,
) -> Result<GroupEncode> {
    let k = comm.size() as usize;
    let code = RsCode::new(k)?;
    let rank = comm.rank() as usize;
    let stripe_size = stripe_size.next_multiple_of(WORD_BYTES);

    let mut src = File::open(my_file)?;
    let my_fs = src.metadata()?.len();
    let sizes = allgather_u64(comm, my_fs)?;
    let max_fs = sizes
        .iter()
        .copied()
        .max()
        .unwrap_or(0)
        .next_multiple_of(WORD_BYTES as u64);

    let holds_parity = rank < PARITY_SHARDS.min(k);
    let mut dst = if holds_parity {
        Some(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(parity_tmp)?)
    } else {
        None
    };
    let mut hasher = Md5::new();

    let mut stripe = vec![0_u8; stripe_size];
    let mut offset = 0_u64;
    while offset < max_fs {
        let len = ((max_fs - offset) as usize).min(stripe_size);
        read_stripe(&mut src, my_fs, offset, &mut stripe[..len])?;
        let gathered = comm.allgather(&stripe[..len])?;
        if let Some(dst) = dst.as_mut() {
            let refs: Vec<&[u8]> = gathered.iter().map(Vec::as_slice).collect();
            let parity = code.encode_parity(rank, &refs)?;
            hasher.update(&parity);
            dst.write_all(&parity)?;
        }
        offset += len as u64;
    }

    let parity = if let Some(dst) = dst {
        dst.sync_all()?;
        drop(dst);
        fs::rename(parity_tmp, parity_path)?;
        let fragment = ParityFragment {
            size: max_fs,
            digest: hasher.finalize().into(),
        };
        info!(
            fragment = %parity_path.display(),
            size = fragment.size,
            "parity fragment committed"
        );
        Some(fragment)
    } else {
        None
    };

    Ok(GroupEncode { max_fs, parity })
}

/// Rebuild missing data files across the group. Collective over `comm`.
///
/// Survivor accounting runs first: with fewer than `k` intact shards in the
/// whole group the decode fails with `GroupInsufficient` on every rank.
pub fn decode_group(comm: &dyn Communicator, input: &GroupDecode<'_>) -> Result<()> {
    let k = comm.size() as usize;
    let code = RsCode::new(k)?;
    let rank = comm.rank() as usize;
    let stripe_size = input.stripe_size.next_multiple_of(WORD_BYTES);
    let padded = input.max_fs.next_multiple_of(WORD_BYTES as u64);

    // Availability vote: one byte per shard role.
    let flags = [
        u8::from(input.my_data.is_some()),
        u8::from(input.my_parity.is_some()),
    ];
    let gathered = comm.allgather(&flags)?;

    // Shard index convention: data shard r lives on rank r, parity shard
    // k + r on rank r (r < PARITY_SHARDS).
    let mut available: Vec<usize> = Vec::new();
    for (member, member_flags) in gathered.iter().enumerate() {
        if member_flags.first().copied() == Some(1) {
            available.push(member);
        }
    }
    let data_available = available.clone();
    for (member, member_flags) in gathered.iter().enumerate() {
        if member_flags.get(1).copied() == Some(1) {
            available.push(k + member);
        }
    }
    if available.len() < k {
        return Err(StratumError::GroupInsufficient {
            missing: k + PARITY_SHARDS - available.len(),
            total: k + PARITY_SHARDS,
            tolerance: PARITY_SHARDS,
        });
    }
    if data_available.len() == k {
        debug!("all data shards intact, nothing to decode");
        return Ok(());
    }
    let survivors: Vec<usize> = available.into_iter().take(k).collect();
    let decode = code.decode_matrix(&survivors)?;
    let my_row: Vec<u16> = (0..k).map(|col| decode.get(rank, col)).collect();
    let need_rebuild = input.my_data.is_none();

    let mut data_file = input.my_data.map(File::open).transpose()?;
    let mut parity_file = input.my_parity.map(File::open).transpose()?;
    let mut out = if need_rebuild {
        Some(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(input.out_tmp)?)
    } else {
        None
    };

    // Per-stripe framing: every member sends its data stripe then its
    // parity stripe, zero-length when the shard is absent. The layout is
    // fixed by the availability flags everyone just gathered.
    let mut stripe = vec![0_u8; stripe_size];
    let mut offset = 0_u64;
    while offset < padded {
        let len = ((padded - offset) as usize).min(stripe_size);
        let mut contribution = Vec::with_capacity(2 * len);
        if let Some(file) = data_file.as_mut() {
            read_stripe(file, input.my_fs, offset, &mut stripe[..len])?;
            contribution.extend_from_slice(&stripe[..len]);
        }
        if let Some(file) = parity_file.as_mut() {
            let parity_len = file.metadata()?.len();
            read_stripe(file, parity_len, offset, &mut stripe[..len])?;
            contribution.extend_from_slice(&stripe[..len]);
        }
        let gathered_stripes = comm.allgather(&contribution)?;

        if let Some(out) = out.as_mut() {
            // Locate each surviving shard's stripe inside the contributions.
            let mut shard_stripes: Vec<(usize, &[u8])> = Vec::with_capacity(k);
            for &shard in &survivors {
                let member = if shard < k { shard } else { shard - k };
                let member_flags = &gathered[member];
                let member_bytes = &gathered_stripes[member];
                let slice = if shard < k {
                    &member_bytes[..len]
                } else {
                    let skip = usize::from(member_flags[0] == 1) * len;
                    &member_bytes[skip..skip + len]
                };
                shard_stripes.push((shard, slice));
            }
            let mut rebuilt = vec![0_u8; len];
            for word in 0..len / WORD_BYTES {
                let mut acc = 0_u16;
                for (col, &(_, bytes)) in shard_stripes.iter().enumerate() {
                    let value = u16::from_le_bytes([
                        bytes[word * WORD_BYTES],
                        bytes[word * WORD_BYTES + 1],
                    ]);
                    acc ^= crate::galois::gf_mul(my_row[col], value);
                }
                rebuilt[word * WORD_BYTES..word * WORD_BYTES + WORD_BYTES]
                    .copy_from_slice(&acc.to_le_bytes());
            }
            out.write_all(&rebuilt)?;
        }
        offset += len as u64;
    }

    if let Some(out) = out {
        out.set_len(input.my_fs)?;
        out.sync_all()?;
        drop(out);
        fs::rename(input.out_tmp, input.out_path)?;
        info!(
            rebuilt = %input.out_path.display(),
            fs = input.my_fs,
            "data shard reconstructed"
        );
    }
    Ok(())
}
