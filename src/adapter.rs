//! Framework adapter surface.
//!
//! A test-framework integration needs exactly three calls from the engine:
//! `decide` before the body, coverage capture around it, and
//! `record_outcome` (or `forget`) afterwards. [`run_guarded`] strings them
//! together for adapters that can hand the engine the test body.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crate::coverage::CoverageCollector;
use crate::predict::{Prediction, Reason};
use crate::session::Session;
use crate::unit::TestId;

pub trait SkipEngine: Sync {
    fn decide(&self, test: &TestId) -> Prediction;
    fn record_outcome(&self, test: &TestId, covered: BTreeSet<String>);
    fn forget(&self, test: &TestId);
}

impl SkipEngine for Session {
    fn decide(&self, test: &TestId) -> Prediction {
        Session::decide(self, test)
    }

    fn record_outcome(&self, test: &TestId, covered: BTreeSet<String>) {
        Session::record_outcome(self, test, covered);
    }

    fn forget(&self, test: &TestId) {
        Session::forget(self, test);
    }
}

/// What to do with the coverage of a test that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Record it like a pass; the test skips again only once its inputs
    /// change and it is re-run.
    #[default]
    KeepCoverage,
    /// Drop the record so the next session runs the test unconditionally.
    ClearRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestExecution {
    Skipped(Reason),
    Ran { passed: bool, reason: Reason },
}

/// Decide, and if the test must run, execute `body` under a coverage
/// capture and report the result. `body` returns whether the test passed.
/// A panicking body counts as a failure; the panic is resumed after the
/// outcome has been reported so the framework still sees it.
pub fn run_guarded<E, F>(
    engine: &E,
    collector: &CoverageCollector,
    test: &TestId,
    policy: FailurePolicy,
    body: F,
) -> TestExecution
where
    E: SkipEngine + ?Sized,
    F: FnOnce() -> bool,
{
    let prediction = engine.decide(test);
    if prediction.is_skip() {
        return TestExecution::Skipped(prediction.reason);
    }

    let capture = collector.begin_capture(test);
    let result = catch_unwind(AssertUnwindSafe(body));
    let covered = capture.end_capture();

    let passed = matches!(result, Ok(true));
    if passed || policy == FailurePolicy::KeepCoverage {
        engine.record_outcome(test, covered);
    } else {
        engine.forget(test);
    }

    if let Err(payload) = result {
        resume_unwind(payload);
    }
    TestExecution::Ran {
        passed,
        reason: prediction.reason,
    }
}
