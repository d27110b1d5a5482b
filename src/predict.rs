//! Skip prediction and the reason model.

use serde::{Serialize, Serializer};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::change::ChangeDetector;
use crate::unit::{AnalysisSnapshot, TestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Run,
    Skip,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Decision::Run => "RUN",
            Decision::Skip => "SKIP",
        })
    }
}

/// Why a decision was made. `Display` renders the machine-checkable form,
/// e.g. `DEPENDENCY_CHANGED(com.example.LeftPadder)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reason {
    NoPriorRecord,
    TestClassChanged,
    /// First covered unit (in name order) that changed or is unknown.
    DependencyChanged(String),
    NoRelevantChange,
    EvaluationFailed,
}

impl Reason {
    pub fn code(&self) -> &'static str {
        match self {
            Reason::NoPriorRecord => "NO_PRIOR_RECORD",
            Reason::TestClassChanged => "TEST_CLASS_CHANGED",
            Reason::DependencyChanged(_) => "DEPENDENCY_CHANGED",
            Reason::NoRelevantChange => "NO_RELEVANT_CHANGE",
            Reason::EvaluationFailed => "EVALUATION_FAILED",
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            Reason::DependencyChanged(unit) => Some(unit),
            _ => None,
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::DependencyChanged(unit) => write!(f, "{}({unit})", self.code()),
            other => f.write_str(other.code()),
        }
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prediction {
    pub decision: Decision,
    pub reason: Reason,
}

impl Prediction {
    pub fn run(reason: Reason) -> Self {
        Self {
            decision: Decision::Run,
            reason,
        }
    }

    pub fn skip() -> Self {
        Self {
            decision: Decision::Skip,
            reason: Reason::NoRelevantChange,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.decision == Decision::Skip
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.decision, self.reason)
    }
}

/// Pure query over an immutable snapshot. Safe to share across threads.
pub struct SkipPredictor<'a> {
    snapshot: &'a AnalysisSnapshot,
    detector: &'a ChangeDetector,
}

impl<'a> SkipPredictor<'a> {
    pub fn new(snapshot: &'a AnalysisSnapshot, detector: &'a ChangeDetector) -> Self {
        Self { snapshot, detector }
    }

    /// Decide whether `test` must run. Never panics: a fault while
    /// evaluating resolves to RUN.
    pub fn decide(&self, test: &TestId) -> Prediction {
        let prediction = match catch_unwind(AssertUnwindSafe(|| self.evaluate(test))) {
            Ok(prediction) => prediction,
            Err(_) => {
                tracing::warn!(test = %test, "decision evaluation panicked; running test");
                Prediction::run(Reason::EvaluationFailed)
            }
        };
        tracing::debug!(test = %test, %prediction, "decided");
        prediction
    }

    fn evaluate(&self, test: &TestId) -> Prediction {
        let Some(record) = self.snapshot.record(test) else {
            return Prediction::run(Reason::NoPriorRecord);
        };

        if self
            .detector
            .classify(&record.test_class, record.test_class_hash)
            .must_run()
        {
            return Prediction::run(Reason::TestClassChanged);
        }

        // BTreeMap iteration keeps the offending unit stable across runs
        for (unit, stored) in &record.covered {
            if self.detector.classify(unit, *stored).must_run() {
                return Prediction::run(Reason::DependencyChanged(unit.clone()));
            }
        }

        Prediction::skip()
    }

    /// One decision for every recorded method of `class`: SKIP only if all
    /// of them would skip, otherwise the first method that must run decides.
    pub fn decide_class(&self, class: &str) -> Prediction {
        let mut recorded = false;
        for (test, _) in self.snapshot.tests_of_class(class) {
            recorded = true;
            let prediction = self.decide(test);
            if !prediction.is_skip() {
                return prediction;
            }
        }
        if recorded {
            Prediction::skip()
        } else {
            Prediction::run(Reason::NoPriorRecord)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SkippyResult;
    use crate::fingerprint::{Fingerprinter, MemorySource, UnitSource};
    use crate::unit::{TestImpactRecord, UnitHash};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn id(raw: &str) -> TestId {
        TestId::parse(raw).unwrap()
    }

    fn record(class: &str, class_src: &str, covered: &[(&str, &str)]) -> TestImpactRecord {
        TestImpactRecord {
            test_class: class.into(),
            test_class_hash: Some(UnitHash::of(class_src.as_bytes())),
            covered: covered
                .iter()
                .map(|(n, src)| (n.to_string(), Some(UnitHash::of(src.as_bytes()))))
                .collect::<BTreeMap<_, _>>(),
            observed_at: Utc::now(),
        }
    }

    fn workspace() -> MemorySource {
        MemorySource::new()
            .with_unit("p.PadTest", "pad test")
            .with_unit("p.Left", "left v1")
            .with_unit("p.Right", "right v1")
            .with_unit("p.Util", "util v1")
    }

    fn snapshot() -> AnalysisSnapshot {
        let mut snap = AnalysisSnapshot::empty();
        snap.tests.insert(
            id("p.PadTest#left"),
            record("p.PadTest", "pad test", &[("p.Left", "left v1"), ("p.Util", "util v1")]),
        );
        snap.tests.insert(
            id("p.PadTest#right"),
            record("p.PadTest", "pad test", &[("p.Right", "right v1")]),
        );
        snap
    }

    #[test]
    fn unrecorded_test_runs() {
        let snap = snapshot();
        let det = ChangeDetector::new(Fingerprinter::new(workspace()));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.Other#x"));
        assert_eq!(p, Prediction::run(Reason::NoPriorRecord));
    }

    #[test]
    fn unchanged_closure_skips() {
        let snap = snapshot();
        let det = ChangeDetector::new(Fingerprinter::new(workspace()));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.PadTest#left"));
        assert!(p.is_skip());
        assert_eq!(p.reason.to_string(), "NO_RELEVANT_CHANGE");
    }

    #[test]
    fn changed_test_class_runs() {
        let snap = snapshot();
        let det = ChangeDetector::new(Fingerprinter::new(
            workspace().with_unit("p.PadTest", "pad test, edited"),
        ));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.PadTest#right"));
        assert_eq!(p, Prediction::run(Reason::TestClassChanged));
    }

    #[test]
    fn first_changed_dependency_is_named_in_name_order() {
        let snap = snapshot();
        let det = ChangeDetector::new(Fingerprinter::new(
            workspace()
                .with_unit("p.Util", "util v2")
                .with_unit("p.Left", "left v2"),
        ));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.PadTest#left"));
        assert_eq!(p.to_string(), "RUN DEPENDENCY_CHANGED(p.Left)");
        assert_eq!(p.reason.unit(), Some("p.Left"));
    }

    #[test]
    fn deleted_dependency_is_unknown_and_runs() {
        let snap = snapshot();
        let mut source = workspace();
        source.remove("p.Right");
        let det = ChangeDetector::new(Fingerprinter::new(source));
        let predictor = SkipPredictor::new(&snap, &det);
        assert_eq!(
            predictor.decide(&id("p.PadTest#right")),
            Prediction::run(Reason::DependencyChanged("p.Right".into()))
        );
        assert!(predictor.decide(&id("p.PadTest#left")).is_skip());
    }

    #[test]
    fn unit_unknown_at_record_time_runs() {
        let mut snap = AnalysisSnapshot::empty();
        let mut rec = record("p.PadTest", "pad test", &[]);
        rec.covered.insert("p.Left".into(), None);
        snap.tests.insert(id("p.PadTest#left"), rec);

        let det = ChangeDetector::new(Fingerprinter::new(workspace()));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.PadTest#left"));
        assert_eq!(p.reason, Reason::DependencyChanged("p.Left".into()));
    }

    #[test]
    fn class_decision_runs_if_any_method_runs() {
        let snap = snapshot();
        let clean = ChangeDetector::new(Fingerprinter::new(workspace()));
        assert!(SkipPredictor::new(&snap, &clean).decide_class("p.PadTest").is_skip());

        let dirty = ChangeDetector::new(Fingerprinter::new(
            workspace().with_unit("p.Right", "right v2"),
        ));
        assert_eq!(
            SkipPredictor::new(&snap, &dirty).decide_class("p.PadTest"),
            Prediction::run(Reason::DependencyChanged("p.Right".into()))
        );
        assert_eq!(
            SkipPredictor::new(&snap, &dirty).decide_class("p.Unseen"),
            Prediction::run(Reason::NoPriorRecord)
        );
    }

    struct ExplodingSource;

    impl UnitSource for ExplodingSource {
        fn read_unit(&self, _unit: &str) -> SkippyResult<Vec<u8>> {
            panic!("class loader blew up");
        }
    }

    #[test]
    fn panic_during_evaluation_resolves_to_run() {
        let snap = snapshot();
        let det = ChangeDetector::new(Fingerprinter::new(ExplodingSource));
        let p = SkipPredictor::new(&snap, &det).decide(&id("p.PadTest#left"));
        assert_eq!(p, Prediction::run(Reason::EvaluationFailed));
    }

    #[test]
    fn prediction_serializes_reason_as_code() {
        let json = serde_json::to_string(&Prediction::run(Reason::DependencyChanged("p.A".into())))
            .unwrap();
        assert_eq!(json, r#"{"decision":"RUN","reason":"DEPENDENCY_CHANGED(p.A)"}"#);
    }
}
