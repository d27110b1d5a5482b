//! Change detection: current workspace fingerprints versus stored hashes.

use dashmap::DashMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::fingerprint::Fingerprinter;
use crate::unit::{AnalysisSnapshot, ClassFingerprint, UnitHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Unchanged,
    Changed,
    /// Not fingerprintable now, or never recorded. Treated like `Changed`.
    Unknown,
}

impl ChangeKind {
    pub fn must_run(self) -> bool {
        self != ChangeKind::Unchanged
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Changed => "changed",
            ChangeKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitDelta {
    pub unit: String,
    pub change: ChangeKind,
}

/// Classification of every unit a snapshot references.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeltaSummary {
    pub unchanged: usize,
    pub changed: usize,
    pub unknown: usize,
    /// Only the units that are not unchanged, in name order.
    pub changes: Vec<UnitDelta>,
}

impl DeltaSummary {
    pub fn is_clean(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Classifies units against stored hashes. Current fingerprints are
/// computed at most once per detector, so one session sees one consistent
/// view of the workspace.
pub struct ChangeDetector {
    fingerprinter: Fingerprinter,
    memo: DashMap<String, ClassFingerprint>,
}

impl ChangeDetector {
    pub fn new(fingerprinter: Fingerprinter) -> Self {
        Self {
            fingerprinter,
            memo: DashMap::new(),
        }
    }

    /// Current fingerprint of `unit` (memoized).
    pub fn current(&self, unit: &str) -> ClassFingerprint {
        if let Some(hit) = self.memo.get(unit) {
            return hit.clone();
        }
        let computed = self.fingerprinter.fingerprint(unit);
        // two threads may race on a miss; both computed the same value
        self.memo
            .entry(unit.to_string())
            .or_insert(computed)
            .clone()
    }

    pub fn classify(&self, unit: &str, stored: Option<UnitHash>) -> ChangeKind {
        let Some(stored) = stored else {
            return ChangeKind::Unknown;
        };
        match self.current(unit).hash {
            None => ChangeKind::Unknown,
            Some(current) if current == stored => ChangeKind::Unchanged,
            Some(_) => ChangeKind::Changed,
        }
    }

    /// Fingerprint `units` in parallel so later lookups are memo hits.
    pub fn warm<'a, I>(&self, units: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pending: Vec<&str> = units
            .into_iter()
            .filter(|unit| !self.memo.contains_key(*unit))
            .collect();
        pending.par_iter().for_each(|unit| {
            self.current(unit);
        });
    }

    /// Classify every unit the snapshot references against its table entry.
    pub fn delta(&self, snapshot: &AnalysisSnapshot) -> DeltaSummary {
        let units: Vec<&str> = snapshot.referenced_units().into_iter().collect();
        self.warm(units.iter().copied());

        let mut summary = DeltaSummary::default();
        for unit in units {
            let stored = snapshot.fingerprint(unit).and_then(|fp| fp.hash);
            let change = self.classify(unit, stored);
            match change {
                ChangeKind::Unchanged => {
                    summary.unchanged += 1;
                    continue;
                }
                ChangeKind::Changed => summary.changed += 1,
                ChangeKind::Unknown => summary.unknown += 1,
            }
            summary.changes.push(UnitDelta {
                unit: unit.to_string(),
                change,
            });
        }
        summary
    }
}
