//! Analysis repository: the one durable artifact per project.
//!
//! Reads never fail a session (missing → empty, corrupt → empty + warning).
//! Writes go through [`AnalysisRepository::persist_updates`], which re-reads
//! the file, merges this session's updates on top and swaps the result in
//! only if nobody replaced the file in between, retrying otherwise.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::atomic_write::{state_of_content, AtomicWriter, CasError, FileState, WriteOptions, WriteStats};
use crate::config::Config;
use crate::error::{SkippyError, SkippyResult};
use crate::snapshot_codec;
use crate::unit::{AnalysisSnapshot, ClassFingerprint, TestId, TestImpactRecord};

// ── Session updates & merge ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The test ran; its record is replaced wholesale.
    Observed(TestImpactRecord),
    /// The adapter asked for the record to be dropped.
    Forgotten,
}

/// Everything one session wants to change in the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdates {
    pub fingerprints: BTreeMap<String, ClassFingerprint>,
    pub outcomes: BTreeMap<TestId, Outcome>,
}

impl SessionUpdates {
    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty() && self.outcomes.is_empty()
    }

    pub fn observe(&mut self, test: TestId, record: TestImpactRecord) {
        self.outcomes.insert(test, Outcome::Observed(record));
    }

    pub fn forget(&mut self, test: TestId) {
        self.outcomes.insert(test, Outcome::Forgotten);
    }

    pub fn add_fingerprint(&mut self, fingerprint: ClassFingerprint) {
        if fingerprint.is_known() {
            self.fingerprints
                .insert(fingerprint.name.clone(), fingerprint);
        }
    }
}

/// `old ⊕ updates`: observed tests replace their record, forgotten tests
/// lose it, everything else is kept. The fingerprint table is the union
/// with newer values winning, pruned to the units some record references.
pub fn merge(old: &AnalysisSnapshot, updates: &SessionUpdates) -> AnalysisSnapshot {
    let mut next = old.clone();

    for (name, fingerprint) in &updates.fingerprints {
        if fingerprint.is_known() {
            next.classes.insert(name.clone(), fingerprint.clone());
        }
    }

    let mut replaced = 0usize;
    let mut forgotten = 0usize;
    for (test, outcome) in &updates.outcomes {
        match outcome {
            Outcome::Observed(record) => {
                next.updated_at = next.updated_at.max(Some(record.observed_at));
                next.tests.insert(test.clone(), record.clone());
                replaced += 1;
            }
            Outcome::Forgotten => {
                if next.tests.remove(test).is_some() {
                    forgotten += 1;
                }
            }
        }
    }

    let referenced: std::collections::BTreeSet<String> = next
        .referenced_units()
        .into_iter()
        .map(str::to_string)
        .collect();
    let before = next.classes.len();
    next.classes.retain(|name, _| referenced.contains(name));

    tracing::debug!(
        replaced,
        forgotten,
        pruned = before - next.classes.len(),
        classes = next.classes.len(),
        tests = next.tests.len(),
        "merged session updates"
    );
    next
}

// ── Repository ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PersistReport {
    pub attempts: u32,
    /// Retries ran out and the write went ahead without the CAS check.
    pub best_effort: bool,
    pub stats: WriteStats,
    pub snapshot: AnalysisSnapshot,
}

#[derive(Debug, Clone)]
pub struct AnalysisRepository {
    path: PathBuf,
    durable: bool,
    max_retries: u32,
    backoff: Duration,
}

impl AnalysisRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            durable: true,
            max_retries: 3,
            backoff: Duration::from_millis(25),
        }
    }

    pub fn from_config(config: &Config, project_root: &Path) -> Self {
        Self {
            path: config.snapshot_path(project_root),
            durable: config.snapshot.durable,
            max_retries: config.persist.max_retries,
            backoff: Duration::from_millis(config.persist.backoff_ms),
        }
    }

    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot, degrading to empty on any problem.
    pub fn load(&self) -> AnalysisSnapshot {
        match self.try_load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unusable snapshot; every test will run");
                AnalysisSnapshot::empty()
            }
        }
    }

    /// Strict load: a missing file is still an empty snapshot, but corruption
    /// and I/O failures are reported.
    pub fn try_load(&self) -> SkippyResult<AnalysisSnapshot> {
        match self.read_raw()? {
            None => Ok(AnalysisSnapshot::empty()),
            Some(bytes) => snapshot_codec::decode(&bytes)
                .map_err(|reason| SkippyError::corrupt(&self.path, reason)),
        }
    }

    fn read_raw(&self) -> SkippyResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SkippyError::io(&self.path, err)),
        }
    }

    /// Current snapshot plus the file state it was decoded from. Corrupt
    /// content decodes as empty but still pins the CAS expectation.
    fn read_current(&self) -> Result<(AnalysisSnapshot, Option<FileState>)> {
        let Some(bytes) = self.read_raw()? else {
            return Ok((AnalysisSnapshot::empty(), None));
        };
        let state = state_of_content(&bytes);
        let snapshot = match snapshot_codec::decode(&bytes) {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %reason,
                    "replacing corrupt snapshot"
                );
                AnalysisSnapshot::empty()
            }
        };
        Ok((snapshot, Some(state)))
    }

    /// Unconditionally replace the stored snapshot.
    pub fn persist(&self, snapshot: &AnalysisSnapshot) -> Result<WriteStats> {
        let bytes = snapshot_codec::encode(snapshot).context("Failed to serialise snapshot")?;
        AtomicWriter::new(WriteOptions::with_durability(self.durable))
            .write_bytes(&self.path, &bytes)
            .with_context(|| format!("Failed to persist snapshot {}", self.path.display()))
    }

    /// Read-merge-write with compare-and-swap, retried with exponential
    /// backoff when another writer got there first. After `max_retries`
    /// lost races the merge is written anyway.
    pub fn persist_updates(&self, updates: &SessionUpdates) -> Result<PersistReport> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let (current, observed) = self.read_current()?;
            let merged = merge(&current, updates);
            let bytes = snapshot_codec::encode(&merged).context("Failed to serialise snapshot")?;

            #[cfg(test)]
            tests::run_interleave_hook(attempts);

            let options = WriteOptions::with_durability(self.durable).expecting(observed);
            match AtomicWriter::new(options).write_bytes(&self.path, &bytes) {
                Ok(stats) => {
                    return Ok(PersistReport {
                        attempts,
                        best_effort: false,
                        stats,
                        snapshot: merged,
                    });
                }
                Err(err) if err.downcast_ref::<CasError>().is_some() => {
                    if attempts > self.max_retries {
                        let conflict = SkippyError::ConcurrentPersistConflict {
                            path: self.path.clone(),
                            attempts,
                        };
                        tracing::warn!(%conflict, "retries exhausted; persisting best-effort");
                        // merge onto the latest file so rival records survive
                        let (latest, _) = self.read_current()?;
                        let merged = merge(&latest, updates);
                        let bytes = snapshot_codec::encode(&merged)
                            .context("Failed to serialise snapshot")?;
                        let stats = AtomicWriter::new(WriteOptions::with_durability(self.durable))
                            .write_bytes(&self.path, &bytes)
                            .with_context(|| {
                                format!("Failed to persist snapshot {}", self.path.display())
                            })?;
                        return Ok(PersistReport {
                            attempts,
                            best_effort: true,
                            stats,
                            snapshot: merged,
                        });
                    }
                    let backoff = self.backoff * (1u32 << (attempts - 1).min(10));
                    tracing::debug!(attempts, cause = %err, ?backoff, "snapshot changed underneath; re-merging");
                    std::thread::sleep(backoff);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Failed to persist snapshot {}", self.path.display()));
                }
            }
        }
    }

    /// Delete the stored snapshot. Returns true if one existed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove {}", self.path.display()))
            }
        }
    }
}
