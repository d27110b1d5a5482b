//! Session coordination: one test-suite run against one snapshot.
//!
//! The snapshot is loaded once at [`Session::open`] and never mutated while
//! the session lives; decisions are pure reads. Outcomes are buffered per
//! test and merged into the repository by [`Session::close`].

use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::change::ChangeDetector;
use crate::config::Config;
use crate::fingerprint::{ClassRootSource, Fingerprinter};
use crate::predict::{Prediction, SkipPredictor};
use crate::repository::{AnalysisRepository, Outcome, SessionUpdates};
use crate::unit::{AnalysisSnapshot, TestId, TestImpactRecord};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub recorded: usize,
    pub forgotten: usize,
    /// False when nothing was buffered and the snapshot was left alone.
    pub persisted: bool,
    pub attempts: u32,
    pub best_effort: bool,
    pub tests_total: usize,
}

pub struct Session {
    repository: AnalysisRepository,
    snapshot: AnalysisSnapshot,
    detector: ChangeDetector,
    pending: DashMap<TestId, Outcome>,
}

impl Session {
    pub fn open(repository: AnalysisRepository, fingerprinter: Fingerprinter) -> Self {
        let snapshot = repository.load();
        tracing::info!(
            path = %repository.path().display(),
            tests = snapshot.tests.len(),
            classes = snapshot.classes.len(),
            "session opened"
        );
        Self {
            repository,
            snapshot,
            detector: ChangeDetector::new(fingerprinter),
            pending: DashMap::new(),
        }
    }

    /// Session over a project's configured snapshot and class roots.
    pub fn open_project(project_root: &Path, config: &Config) -> Self {
        let source = ClassRootSource::new(
            config.class_roots(project_root),
            config.fingerprint.max_unit_bytes,
        );
        Self::open(
            AnalysisRepository::from_config(config, project_root),
            Fingerprinter::new(source),
        )
    }

    pub fn snapshot(&self) -> &AnalysisSnapshot {
        &self.snapshot
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn repository(&self) -> &AnalysisRepository {
        &self.repository
    }

    pub fn predictor(&self) -> SkipPredictor<'_> {
        SkipPredictor::new(&self.snapshot, &self.detector)
    }

    pub fn decide(&self, test: &TestId) -> Prediction {
        self.predictor().decide(test)
    }

    pub fn decide_class(&self, class: &str) -> Prediction {
        self.predictor().decide_class(class)
    }

    /// Buffer the coverage of a test that actually ran. Every covered unit
    /// is fingerprinted now; units that cannot be read are stored without
    /// a hash so the test runs again next session.
    pub fn record_outcome<I, S>(&self, test: &TestId, covered: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let test_class = test.class();
        let units: BTreeSet<String> = covered
            .into_iter()
            .map(|unit| unit.as_ref().to_string())
            .filter(|unit| unit != test_class)
            .collect();
        self.detector
            .warm(units.iter().map(String::as_str).chain([test_class]));

        let record = TestImpactRecord {
            test_class: test_class.to_string(),
            test_class_hash: self.detector.current(test_class).hash,
            covered: units
                .into_iter()
                .map(|unit| {
                    let hash = self.detector.current(&unit).hash;
                    (unit, hash)
                })
                .collect(),
            observed_at: chrono::Utc::now(),
        };
        let units = record.covered.len();
        if self
            .pending
            .insert(test.clone(), Outcome::Observed(record))
            .is_some()
        {
            tracing::debug!(test = %test, "outcome recorded twice; keeping the latest");
        }
        tracing::debug!(test = %test, units, "outcome recorded");
    }

    /// Drop `test`'s record at close (e.g. the test failed and the adapter
    /// does not trust its coverage).
    pub fn forget(&self, test: &TestId) {
        self.pending.insert(test.clone(), Outcome::Forgotten);
        tracing::debug!(test = %test, "record will be cleared");
    }

    pub fn pending_outcomes(&self) -> usize {
        self.pending.len()
    }

    fn drain_updates(self) -> (AnalysisRepository, ChangeDetector, SessionUpdates) {
        let mut updates = SessionUpdates::default();
        for (test, outcome) in self.pending {
            updates.outcomes.insert(test, outcome);
        }
        (self.repository, self.detector, updates)
    }

    /// Merge this session's outcomes into the stored snapshot. Must only be
    /// called once every `record_outcome` has returned.
    pub fn close(self) -> Result<SessionReport> {
        let (repository, detector, mut updates) = self.drain_updates();
        let mut report = SessionReport::default();
        for outcome in updates.outcomes.values() {
            match outcome {
                Outcome::Observed(_) => report.recorded += 1,
                Outcome::Forgotten => report.forgotten += 1,
            }
        }
        if updates.is_empty() {
            tracing::info!("session closed without updates");
            return Ok(report);
        }

        let observed_units: BTreeSet<String> = updates
            .outcomes
            .values()
            .filter_map(|outcome| match outcome {
                Outcome::Observed(record) => Some(record),
                Outcome::Forgotten => None,
            })
            .flat_map(|record| {
                std::iter::once(record.test_class.clone()).chain(record.covered.keys().cloned())
            })
            .collect();
        for unit in &observed_units {
            updates.add_fingerprint(detector.current(unit));
        }

        let persisted = repository.persist_updates(&updates)?;
        report.persisted = true;
        report.attempts = persisted.attempts;
        report.best_effort = persisted.best_effort;
        report.tests_total = persisted.snapshot.tests.len();
        tracing::info!(
            recorded = report.recorded,
            forgotten = report.forgotten,
            attempts = report.attempts,
            "session closed"
        );
        Ok(report)
    }
}
