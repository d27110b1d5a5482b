//! Error taxonomy for the engine.
//!
//! Most of these never escape a session: unreadable units degrade to
//! `UNKNOWN`, corrupt snapshots degrade to an empty snapshot and persist
//! conflicts are retried. They exist as typed values so callers can tell
//! the degraded paths apart (and so the persist loop can downcast them).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SkippyError {
    /// A unit could not be located, read or parsed.
    #[error("unreadable unit {unit}: {reason}")]
    UnreadableUnit { unit: String, reason: String },

    /// The persisted snapshot exists but failed the integrity check.
    #[error("corrupt snapshot at {}: {reason}", path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    /// Another process replaced the snapshot while this one was merging.
    #[error("snapshot {} changed concurrently ({attempts} attempts)", path.display())]
    ConcurrentPersistConflict { path: PathBuf, attempts: u32 },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid test id '{0}'")]
    InvalidTestId(String),

    #[error("config error: {0}")]
    Config(String),
}

impl SkippyError {
    pub fn unreadable(unit: impl Into<String>, reason: impl ToString) -> Self {
        Self::UnreadableUnit {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptSnapshot {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type SkippyResult<T> = std::result::Result<T, SkippyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_unit() {
        let err = SkippyError::unreadable("com.example.Foo", "not found");
        assert_eq!(
            err.to_string(),
            "unreadable unit com.example.Foo: not found"
        );
    }

    #[test]
    fn corrupt_snapshot_mentions_path() {
        let err = SkippyError::corrupt("/tmp/snap", "truncated");
        assert!(err.to_string().contains("/tmp/snap"));
        assert!(err.to_string().contains("truncated"));
    }
}
