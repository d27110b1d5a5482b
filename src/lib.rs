//! Test-impact analysis and skip prediction.
//!
//! A [`Session`] loads the project's snapshot once, answers "must this test
//! run?" for every test the framework is about to execute, buffers the
//! coverage of the tests that did run, and merges it back into the snapshot
//! when the suite finishes.

pub mod adapter;
pub mod atomic_write;
pub mod change;
pub mod config;
pub mod coverage;
pub mod error;
pub mod fingerprint;
pub mod predict;
pub mod repository;
pub mod session;
pub mod snapshot_codec;
pub mod unit;

pub use adapter::{run_guarded, FailurePolicy, SkipEngine, TestExecution};
pub use change::{ChangeDetector, ChangeKind, DeltaSummary};
pub use config::Config;
pub use coverage::{CoverageCollector, Probe};
pub use error::{SkippyError, SkippyResult};
pub use fingerprint::{ClassRootSource, Fingerprinter, MemorySource, UnitSource};
pub use predict::{Decision, Prediction, Reason, SkipPredictor};
pub use repository::{AnalysisRepository, SessionUpdates};
pub use session::{Session, SessionReport};
pub use unit::{AnalysisSnapshot, ClassFingerprint, TestId, TestImpactRecord, UnitHash};
