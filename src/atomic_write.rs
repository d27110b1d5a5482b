//! Atomic file replacement with an optional compare-and-swap check.
//!
//! A write goes to a temp file in the target directory and is renamed over
//! the target. When the caller passes the [`FileState`] it read earlier (or
//! expects the file to be absent), the target is checked against it first
//! and a [`CasError`] is returned if another writer replaced it.

use anyhow::{Context, Result};
use std::fs::{self, File, Metadata};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    Durable,
    Fast,
}

/// Observed state of a file, used as a compare-and-swap expectation.
/// `None` as a whole means the file did not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileState {
    pub len: u64,
    pub hash: u64,
}

/// Typed CAS error so retry loops can tell a lost race from an I/O failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasError {
    AppearedConcurrently,
    RemovedConcurrently,
    LenMismatch { expected: u64, actual: u64 },
    HashMismatch,
}

impl std::fmt::Display for CasError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CasError::AppearedConcurrently => write!(f, "CAS: target was created concurrently"),
            CasError::RemovedConcurrently => write!(f, "CAS: target was removed concurrently"),
            CasError::LenMismatch { expected, actual } => {
                write!(f, "CAS: length mismatch (expected {expected}, got {actual})")
            }
            CasError::HashMismatch => write!(f, "CAS: content hash changed"),
        }
    }
}

impl std::error::Error for CasError {}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub durability: DurabilityMode,
    pub buffer_size: usize,
    pub idempotent_skip: bool,
    /// `Some(expected)` enables CAS; `Some(None)` expects the file to be absent.
    pub expect: Option<Option<FileState>>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::Durable,
            buffer_size: 64 * 1024,
            idempotent_skip: true,
            expect: None,
        }
    }
}

impl WriteOptions {
    pub fn fast() -> Self {
        Self {
            durability: DurabilityMode::Fast,
            ..Self::default()
        }
    }

    pub fn with_durability(durable: bool) -> Self {
        if durable {
            Self::default()
        } else {
            Self::fast()
        }
    }

    pub fn expecting(mut self, state: Option<FileState>) -> Self {
        self.expect = Some(state);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WriteStats {
    pub bytes_written: u64,
    pub fsync_count: u32,
    pub elapsed: Duration,
    pub skipped_unchanged: bool,
}

pub struct AtomicWriter {
    options: WriteOptions,
}

impl AtomicWriter {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    /// Replace `path` with `content` via a sibling temp file and a rename, so
    /// readers see either the old or the new file, never a mix.
    pub fn write_bytes(&self, path: &Path, content: &[u8]) -> Result<WriteStats> {
        let start = Instant::now();
        let parent = path.parent().with_context(|| {
            format!(
                "Cannot write to {}: path has no parent directory",
                path.display()
            )
        })?;
        let parent: &Path = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };

        let existing_meta = match fs::metadata(path) {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to stat {}", path.display()));
            }
        };

        if let Some(expected) = &self.options.expect {
            verify_cas(path, existing_meta.as_ref(), expected.as_ref())?;
        }

        if self.options.idempotent_skip {
            if let Some(meta) = existing_meta.as_ref() {
                if meta.len() == content.len() as u64 && file_equals_bytes(path, content)? {
                    return Ok(WriteStats {
                        bytes_written: 0,
                        fsync_count: 0,
                        elapsed: start.elapsed(),
                        skipped_unchanged: true,
                    });
                }
            }
        }

        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory for {}", path.display()))?;

        let mut fsync_count = 0u32;
        let mut temp_file = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;

        {
            let mut writer =
                BufWriter::with_capacity(self.options.buffer_size.max(1), temp_file.as_file_mut());
            writer
                .write_all(content)
                .with_context(|| format!("Failed to write {} bytes to temp file", content.len()))?;
            writer.flush().context("Failed to flush temp file")?;
        }

        if self.options.durability == DurabilityMode::Durable {
            temp_file
                .as_file()
                .sync_data()
                .with_context(|| format!("Failed to sync temp data for {}", path.display()))?;
            fsync_count += 1;
        }

        temp_file.persist(path).map_err(|e| {
            anyhow::Error::new(e.error)
                .context(format!("Failed to atomically replace {}", path.display()))
        })?;

        if self.options.durability == DurabilityMode::Durable {
            fsync_parent_dir(parent)
                .with_context(|| format!("Failed to sync parent dir {}", parent.display()))?;
            fsync_count += 1;
        }

        Ok(WriteStats {
            bytes_written: content.len() as u64,
            fsync_count,
            elapsed: start.elapsed(),
            skipped_unchanged: false,
        })
    }
}

/// Current state of `path`, or `None` if it does not exist.
#[cfg(test)]
pub fn file_state(path: &Path) -> Result<Option<FileState>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("Failed to stat {}", path.display())),
    };
    Ok(Some(FileState {
        len: metadata.len(),
        hash: hash_file(path)?,
    }))
}

/// State of a file whose content was already read, avoiding a second read.
pub fn state_of_content(content: &[u8]) -> FileState {
    FileState {
        len: content.len() as u64,
        hash: xxh3_64(content),
    }
}

fn verify_cas(path: &Path, metadata: Option<&Metadata>, expected: Option<&FileState>) -> Result<()> {
    let (metadata, expected) = match (metadata, expected) {
        (None, None) => return Ok(()),
        (Some(_), None) => return Err(CasError::AppearedConcurrently.into()),
        (None, Some(_)) => return Err(CasError::RemovedConcurrently.into()),
        (Some(metadata), Some(expected)) => (metadata, expected),
    };

    if metadata.len() != expected.len {
        return Err(CasError::LenMismatch {
            expected: expected.len,
            actual: metadata.len(),
        }
        .into());
    }

    if hash_file(path)? != expected.hash {
        return Err(CasError::HashMismatch.into());
    }

    Ok(())
}

fn file_equals_bytes(path: &Path, expected: &[u8]) -> Result<bool> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to read existing file {}", path.display()))?;
    let mut buf = [0u8; 8192];
    let mut offset = 0usize;

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read existing file {}", path.display()))?;
        if n == 0 {
            return Ok(offset == expected.len());
        }
        if offset + n > expected.len() {
            return Ok(false);
        }
        if expected.get(offset..offset + n) != Some(&buf[..n]) {
            return Ok(false);
        }
        offset += n;
    }
}

pub fn hash_file(path: &Path) -> Result<u64> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to read existing file {}", path.display()))?;
    let mut hasher = Xxh3::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read existing file {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}

#[cfg(unix)]
fn fsync_parent_dir(parent: &Path) -> Result<()> {
    let dir = File::open(parent)
        .with_context(|| format!("Failed to open parent dir {}", parent.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync parent dir {}", parent.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_parent: &Path) -> Result<()> {
    Ok(())
}
