//! Per-test coverage capture.
//!
//! Instrumented code reports the units it executes through [`hit`]. Every
//! capture that is open on the calling thread receives the hit, so nested
//! (re-entrant) test executions are attributed to both the inner and the
//! outer test. Work a test hands to other threads reports through a
//! [`Probe`] cloned from its capture.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::config::CoverageConfig;
use crate::unit::TestId;

const LAMBDA_MARKER: &str = "$$Lambda";

thread_local! {
    static ACTIVE: RefCell<Vec<Arc<CaptureState>>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug)]
struct CaptureState {
    test: TestId,
    touched: Mutex<BTreeSet<String>>,
}

impl CaptureState {
    fn record(&self, unit: &str) {
        // a poisoned set still holds every hit recorded before the panic
        let mut touched = self.touched.lock().unwrap_or_else(|e| e.into_inner());
        if !touched.contains(unit) {
            touched.insert(unit.to_string());
        }
    }

    fn take(&self) -> BTreeSet<String> {
        let mut touched = self.touched.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *touched)
    }
}

/// Report that `unit` executed on this thread.
pub fn hit(unit: &str) {
    ACTIVE.with(|stack| {
        for state in stack.borrow().iter() {
            state.record(unit);
        }
    });
}

/// Number of captures open on this thread.
pub fn active_captures() -> usize {
    ACTIVE.with(|stack| stack.borrow().len())
}

#[derive(Debug, Clone, Default)]
pub struct CoverageCollector {
    exclude_prefixes: Vec<String>,
}

impl CoverageCollector {
    pub fn new(exclude_prefixes: Vec<String>) -> Self {
        Self { exclude_prefixes }
    }

    pub fn from_config(config: &CoverageConfig) -> Self {
        Self::new(config.exclude_prefixes.clone())
    }

    /// Start collecting for `test` on the calling thread.
    pub fn begin_capture(&self, test: &TestId) -> Capture<'_> {
        let state = Arc::new(CaptureState {
            test: test.clone(),
            touched: Mutex::new(BTreeSet::new()),
        });
        ACTIVE.with(|stack| stack.borrow_mut().push(Arc::clone(&state)));
        tracing::trace!(test = %test, "coverage capture started");
        Capture {
            state,
            collector: self,
            ended: false,
            _thread_bound: PhantomData,
        }
    }

    /// Drop excluded units and fold synthetic lambda classes into their owner.
    pub fn normalize<I, S>(&self, units: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        units
            .into_iter()
            .filter_map(|unit| {
                let unit = unit.as_ref().trim();
                let unit = match unit.find(LAMBDA_MARKER) {
                    Some(pos) => &unit[..pos],
                    None => unit,
                };
                if unit.is_empty() || self.is_excluded(unit) {
                    None
                } else {
                    Some(unit.to_string())
                }
            })
            .collect()
    }

    fn is_excluded(&self, unit: &str) -> bool {
        self.exclude_prefixes
            .iter()
            .any(|prefix| unit.starts_with(prefix.as_str()))
    }
}

/// An open capture. Bound to the thread that started it; ends (discarding
/// its hits) when dropped without [`Capture::end_capture`].
pub struct Capture<'c> {
    state: Arc<CaptureState>,
    collector: &'c CoverageCollector,
    ended: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Capture<'_> {
    /// Handle that other threads can use to report hits for this capture.
    pub fn probe(&self) -> Probe {
        Probe(Arc::clone(&self.state))
    }

    /// Stop collecting and return every unit touched since `begin_capture`.
    pub fn end_capture(mut self) -> BTreeSet<String> {
        self.detach();
        let touched = self.state.take();
        let covered = self.collector.normalize(touched);
        tracing::trace!(test = %self.state.test, units = covered.len(), "coverage capture ended");
        covered
    }

    fn detach(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        ACTIVE.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|s| Arc::ptr_eq(s, &self.state)) {
                stack.remove(pos);
            }
        });
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Cross-thread reporting handle for one capture.
#[derive(Debug, Clone)]
pub struct Probe(Arc<CaptureState>);

impl Probe {
    pub fn hit(&self, unit: &str) {
        self.0.record(unit);
    }
}

/// Parse a covered-unit list produced by an external coverage tool: one
/// unit per line, dotted or JVM-internal (`com/example/Foo`) form, `#`
/// comments and blank lines ignored.
pub fn parse_covered_list(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.strip_suffix(".class")
                .unwrap_or(line)
                .replace('/', ".")
        })
        .collect()
}
