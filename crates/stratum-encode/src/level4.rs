//! L4 flush: move per-rank checkpoint bytes onto the parallel filesystem.
//!
//! The writer strategy is the pluggable seam for alternate serializers.
//! Every strategy produces per-rank bytes of known size with a checksum;
//! the variable table travels in the sidecar metadata, never inside the
//! file. Only the single-writer POSIX strategy is implemented; the others
//! are coerced to it at configuration validation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use stratum_error::{Result, StratumError};
use stratum_types::{SerializerKind, VarId};
use tracing::debug;

/// Receipt of a finalized flush.
#[derive(Debug, Clone)]
pub struct FlushReceipt {
    /// Final file size in bytes.
    pub fs: u64,
    /// MD5 of the whole file.
    pub digest: [u8; 16],
    /// `(id, size)` per variable, in write order.
    pub vars: Vec<(VarId, u64)>,
}

/// Common operation set of the L4 writer strategies.
pub trait CkptWriter: Send {
    /// Begin a new per-rank output; bytes accumulate in `tmp` until
    /// [`CkptWriter::finalize`] renames it to `dst`.
    fn open(&mut self, dst: &Path, tmp: &Path) -> Result<()>;

    /// Append one variable's bytes.
    fn write_var(&mut self, id: VarId, bytes: &[u8]) -> Result<()>;

    /// Sync, commit by rename, and report size, checksum and var table.
    fn finalize(&mut self) -> Result<FlushReceipt>;

    /// Read back every variable using the sidecar var table.
    fn recover(&self, src: &Path, table: &[(VarId, u64)]) -> Result<Vec<(VarId, Vec<u8>)>>;

    /// Read back a single variable using the sidecar var table.
    fn recover_var(&self, src: &Path, table: &[(VarId, u64)], id: VarId) -> Result<Vec<u8>>;
}

/// Construct the writer for a validated serializer selection.
pub fn writer_for(kind: SerializerKind) -> Result<Box<dyn CkptWriter>> {
    match kind {
        SerializerKind::Posix => Ok(Box::new(PosixWriter::new())),
        other => Err(StratumError::config(format!(
            "serializer {other:?} is not available in this build"
        ))),
    }
}

struct OpenOutput {
    dst: PathBuf,
    tmp: PathBuf,
    file: BufWriter<File>,
    hasher: Md5,
    vars: Vec<(VarId, u64)>,
    written: u64,
}

/// Single-writer POSIX strategy: raw concatenation, fsync, rename.
#[derive(Default)]
pub struct PosixWriter {
    output: Option<OpenOutput>,
}

impl PosixWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CkptWriter for PosixWriter {
    fn open(&mut self, dst: &Path, tmp: &Path) -> Result<()> {
        if self.output.is_some() {
            return Err(StratumError::Busy);
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp)?;
        self.output = Some(OpenOutput {
            dst: dst.to_path_buf(),
            tmp: tmp.to_path_buf(),
            file: BufWriter::new(file),
            hasher: Md5::new(),
            vars: Vec::new(),
            written: 0,
        });
        Ok(())
    }

    fn write_var(&mut self, id: VarId, bytes: &[u8]) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| StratumError::internal("write_var before open"))?;
        output.file.write_all(bytes)?;
        output.hasher.update(bytes);
        output.vars.push((id, bytes.len() as u64));
        output.written += bytes.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> Result<FlushReceipt> {
        let output = self
            .output
            .take()
            .ok_or_else(|| StratumError::internal("finalize before open"))?;
        let OpenOutput {
            dst,
            tmp,
            file,
            hasher,
            vars,
            written,
        } = output;
        let file = file
            .into_inner()
            .map_err(|err| StratumError::Io(err.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &dst)?;
        debug!(file = %dst.display(), fs = written, "posix flush committed");
        Ok(FlushReceipt {
            fs: written,
            digest: hasher.finalize().into(),
            vars,
        })
    }

    fn recover(&self, src: &Path, table: &[(VarId, u64)]) -> Result<Vec<(VarId, Vec<u8>)>> {
        let mut file = File::open(src).map_err(|_| StratumError::FileMissing {
            path: src.to_path_buf(),
        })?;
        let mut out = Vec::with_capacity(table.len());
        for &(id, size) in table {
            let mut bytes = vec![0_u8; size as usize];
            file.read_exact(&mut bytes)
                .map_err(|_| StratumError::FormatCorrupt {
                    detail: format!("flush file truncated while reading variable {id}"),
                })?;
            out.push((id, bytes));
        }
        Ok(out)
    }

    fn recover_var(&self, src: &Path, table: &[(VarId, u64)], id: VarId) -> Result<Vec<u8>> {
        let mut offset = 0_u64;
        for &(entry, size) in table {
            if entry == id {
                let mut file = File::open(src).map_err(|_| StratumError::FileMissing {
                    path: src.to_path_buf(),
                })?;
                file.seek(SeekFrom::Start(offset))?;
                let mut bytes = vec![0_u8; size as usize];
                file.read_exact(&mut bytes)
                    .map_err(|_| StratumError::FormatCorrupt {
                        detail: format!("flush file truncated while reading variable {id}"),
                    })?;
                return Ok(bytes);
            }
            offset += size;
        }
        Err(StratumError::UnknownVariable { id: id.get() })
    }
}

/// Copy `src` to `dst` through `tmp` in `chunk_size` slices, fsync, rename.
/// Returns the copied size and its MD5.
pub fn copy_file_atomic(
    src: &Path,
    dst: &Path,
    tmp: &Path,
    chunk_size: usize,
) -> Result<(u64, [u8; 16])> {
    let mut input = File::open(src).map_err(|_| StratumError::FileMissing {
        path: src.to_path_buf(),
    })?;
    let total = input.metadata()?.len();
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; chunk_size];
    let mut copied = 0_u64;
    while copied < total {
        let len = ((total - copied) as usize).min(chunk_size);
        input.read_exact(&mut buffer[..len])?;
        hasher.update(&buffer[..len]);
        output.write_all(&buffer[..len])?;
        copied += len as u64;
    }
    output.sync_all()?;
    drop(output);
    fs::rename(tmp, dst)?;
    Ok((total, hasher.finalize().into()))
}

/// MD5 of a file on disk.
pub fn file_digest(path: &Path) -> Result<[u8; 16]> {
    let mut file = File::open(path).map_err(|_| StratumError::FileMissing {
        path: path.to_path_buf(),
    })?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0_u8; 1 << 16];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().into())
}
