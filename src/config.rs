use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SkippyError, SkippyResult};

pub const PROJECT_CONFIG_FILE: &str = "skippy.toml";
const SNAPSHOT_PATH_ENV: &str = "SKIPPY_SNAPSHOT_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub coverage: CoverageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Relative paths resolve against the project root.
    pub path: PathBuf,
    /// fsync the snapshot and its directory on persist.
    pub durable: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".skippy").join("snapshot.skippy"),
            durable: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub max_retries: u32,
    /// First backoff step; doubles on every retry.
    pub backoff_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub class_roots: Vec<PathBuf>,
    /// Units larger than this are reported as unknown.
    pub max_unit_bytes: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            class_roots: vec![
                "build/classes/java/main".into(),
                "build/classes/java/test".into(),
                "build/classes/kotlin/main".into(),
                "build/classes/kotlin/test".into(),
                "target/classes".into(),
                "target/test-classes".into(),
            ],
            max_unit_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Units under these prefixes are never recorded as covered.
    pub exclude_prefixes: Vec<String>,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            exclude_prefixes: vec![
                "java.".into(),
                "javax.".into(),
                "jdk.".into(),
                "kotlin.".into(),
                "sun.".into(),
                "org.junit.".into(),
                "io.skippy.".into(),
            ],
        }
    }
}

impl Config {
    /// Load the config for `project_root`: `<root>/skippy.toml` first, then the
    /// user config dir, then defaults.
    pub fn load(project_root: &Path) -> Result<Self> {
        let project_file = project_root.join(PROJECT_CONFIG_FILE);
        if project_file.exists() {
            return Self::load_from(&project_file);
        }

        if let Some(user_file) = user_config_path() {
            if user_file.exists() {
                return Self::load_from(&user_file);
            }
        }

        Ok(Config::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> SkippyResult<()> {
        if self.fingerprint.max_unit_bytes == 0 {
            return Err(SkippyError::Config(
                "fingerprint.max_unit_bytes must be positive".into(),
            ));
        }
        if self.fingerprint.class_roots.is_empty() {
            return Err(SkippyError::Config(
                "fingerprint.class_roots must name at least one directory".into(),
            ));
        }
        if self.snapshot.path.as_os_str().is_empty() {
            return Err(SkippyError::Config("snapshot.path is empty".into()));
        }
        Ok(())
    }

    /// Absolute snapshot location. `SKIPPY_SNAPSHOT_PATH` wins over the file.
    pub fn snapshot_path(&self, project_root: &Path) -> PathBuf {
        if let Ok(p) = std::env::var(SNAPSHOT_PATH_ENV) {
            return PathBuf::from(p);
        }
        resolve(project_root, &self.snapshot.path)
    }

    pub fn class_roots(&self, project_root: &Path) -> Vec<PathBuf> {
        self.fingerprint
            .class_roots
            .iter()
            .map(|root| resolve(project_root, root))
            .collect()
    }
}

fn resolve(project_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("skippy").join("config.toml"))
}

pub fn show_config(project_root: &Path) -> Result<()> {
    let project_file = project_root.join(PROJECT_CONFIG_FILE);
    if project_file.exists() {
        println!("Config: {}", project_file.display());
    } else {
        println!("(default config, {} not found)", project_file.display());
    }
    println!();

    let config = Config::load(project_root)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_conservative() {
        let cfg = Config::default();
        assert_eq!(cfg.persist.max_retries, 3);
        assert!(cfg.snapshot.durable);
        assert!(cfg
            .coverage
            .exclude_prefixes
            .iter()
            .any(|p| p == "java."));
    }

    #[test]
    fn project_file_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(PROJECT_CONFIG_FILE),
            "[persist]\nmax_retries = 7\n\n[fingerprint]\nclass_roots = [\"out\"]\n",
        )
        .unwrap();

        let cfg = Config::load(tmp.path()).unwrap();
        assert_eq!(cfg.persist.max_retries, 7);
        assert_eq!(cfg.persist.backoff_ms, 25);
        assert_eq!(cfg.class_roots(tmp.path()), vec![tmp.path().join("out")]);
        // untouched sections keep defaults
        assert!(cfg.snapshot.durable);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(PROJECT_CONFIG_FILE), "[persist\n").unwrap();
        assert!(Config::load(tmp.path()).is_err());
    }

    #[test]
    fn empty_class_roots_are_rejected() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(PROJECT_CONFIG_FILE),
            "[fingerprint]\nclass_roots = []\n",
        )
        .unwrap();
        let err = Config::load(tmp.path()).unwrap_err();
        let typed = err.downcast_ref::<SkippyError>();
        assert!(matches!(typed, Some(SkippyError::Config(_))), "{err:#}");
    }

    #[test]
    fn relative_snapshot_path_resolves_under_project() {
        let cfg = Config::default();
        let root = Path::new("/work/project");
        assert_eq!(
            resolve(root, &cfg.snapshot.path),
            PathBuf::from("/work/project/.skippy/snapshot.skippy")
        );
    }
}
