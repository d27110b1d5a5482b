//! Data model: unit fingerprints, test identifiers, impact records and the
//! snapshot that ties them together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{SkippyError, SkippyResult};

// ── Fingerprints ────────────────────────────────────────────

/// Content hash of a unit. A pure function of the unit's bytes, so two
/// processes fingerprinting identical content always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitHash(u64);

impl UnitHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(xxh3_64(bytes))
    }

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for UnitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for UnitHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}

impl Serialize for UnitHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for UnitHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Fingerprint of one unit: its content hash plus the names of the units
/// it statically references. `hash == None` is the "unknown" sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassFingerprint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<UnitHash>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,
}

impl ClassFingerprint {
    pub fn known(name: impl Into<String>, hash: UnitHash, dependencies: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            hash: Some(hash),
            dependencies,
        }
    }

    pub fn unknown(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: None,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.hash.is_some()
    }
}

// ── Test identifiers ────────────────────────────────────────

/// Fully-qualified test identifier: `<class>#<method>`, or just `<class>`
/// for a class-level id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(String);

impl TestId {
    pub fn new(class: &str, method: &str) -> SkippyResult<Self> {
        Self::parse(&format!("{class}#{method}"))
    }

    pub fn class_level(class: &str) -> SkippyResult<Self> {
        Self::parse(class)
    }

    /// Parameterized method ids such as `T#pad(java.lang.String, int)` may
    /// contain spaces after the `#`; the class part may not.
    pub fn parse(raw: &str) -> SkippyResult<Self> {
        let raw = raw.trim();
        let (class, method) = match raw.split_once('#') {
            Some((class, method)) => (class, Some(method)),
            None => (raw, None),
        };
        let valid = !class.is_empty()
            && !class.chars().any(char::is_whitespace)
            && method.map_or(true, |m| !m.is_empty() && !m.contains('#'));
        if !valid {
            return Err(SkippyError::InvalidTestId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Name of the unit that defines this test.
    pub fn class(&self) -> &str {
        self.0.split_once('#').map(|(c, _)| c).unwrap_or(&self.0)
    }

    pub fn method(&self) -> Option<&str> {
        self.0.split_once('#').map(|(_, m)| m)
    }

}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TestId {
    type Err = SkippyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Records ─────────────────────────────────────────────────

/// What one observed (not skipped) run of a test touched, with the hash of
/// every covered unit at the time of that run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestImpactRecord {
    pub test_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_class_hash: Option<UnitHash>,
    pub covered: BTreeMap<String, Option<UnitHash>>,
    pub observed_at: DateTime<Utc>,
}

impl TestImpactRecord {
    pub fn covers(&self, unit: &str) -> bool {
        self.covered.contains_key(unit)
    }
}

/// Full persisted analysis state for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassFingerprint>,
    #[serde(default)]
    pub tests: BTreeMap<TestId, TestImpactRecord>,
}

impl AnalysisSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.tests.is_empty()
    }

    pub fn record(&self, test: &TestId) -> Option<&TestImpactRecord> {
        self.tests.get(test)
    }

    pub fn fingerprint(&self, unit: &str) -> Option<&ClassFingerprint> {
        self.classes.get(unit)
    }

    /// Recorded tests defined by `class`, in identifier order.
    pub fn tests_of_class<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = (&'a TestId, &'a TestImpactRecord)> + 'a {
        self.tests.iter().filter(move |(id, _)| id.class() == class)
    }

    /// Tests whose last observed run covered `unit` or whose defining
    /// class is `unit`.
    pub fn tests_covering(&self, unit: &str) -> Vec<&TestId> {
        self.tests
            .iter()
            .filter(|(id, record)| id.class() == unit || record.covers(unit))
            .map(|(id, _)| id)
            .collect()
    }

    /// Every unit name referenced by some record.
    pub fn referenced_units(&self) -> BTreeSet<&str> {
        let mut units = BTreeSet::new();
        for record in self.tests.values() {
            units.insert(record.test_class.as_str());
            units.extend(record.covered.keys().map(String::as_str));
        }
        units
    }
}
