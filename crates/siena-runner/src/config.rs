use crate::error::GearError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_DIR: &str = "/flywheel/v0";

/// Directory layout of a gear container.
///
/// Built once by the entry point and handed to [`crate::Gear`]; nothing in the
/// library looks at environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GearEnvironment {
    pub base_dir: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub config_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl GearEnvironment {
    pub fn from_base(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            input_dir: base_dir.join("input"),
            output_dir: base_dir.join("output"),
            work_dir: base_dir.join("work"),
            config_path: base_dir.join("config.json"),
            manifest_path: base_dir.join("manifest.json"),
            base_dir,
        }
    }
}

impl Default for GearEnvironment {
    fn default() -> Self {
        Self::from_base(DEFAULT_BASE_DIR)
    }
}

/// What to do with config keys that are not in the option table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownKeyPolicy {
    /// Log a warning and leave the key out of the command line.
    #[default]
    Ignore,
    /// Fail validation with a `Configuration` error naming the key.
    Reject,
}

impl UnknownKeyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::Reject => "reject",
        }
    }
}

/// Program names for the two tools. Image lineages (stock FSL, optiBET) differ
/// only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinaries {
    pub siena: String,
    pub sienax: String,
}

impl Default for ToolBinaries {
    fn default() -> Self {
        Self {
            siena: "siena".to_string(),
            sienax: "sienax".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub unknown_keys: UnknownKeyPolicy,
    pub timeout: Option<Duration>,
    pub binaries: ToolBinaries,
}

/// Parsed `config.json`: option values plus the declared input files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputEntry>,
}

/// One declared input. Only its location matters to the gear; the platform's
/// other fields (`base`, `object`, ...) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InputEntry {
    pub location: InputLocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputLocation {
    pub path: PathBuf,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<Self, GearError> {
        let data = fs::read_to_string(path).map_err(|e| {
            GearError::configuration(
                "config.json",
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        serde_json::from_str(&data).map_err(|e| {
            GearError::configuration(
                "config.json",
                format!("cannot parse {}: {}", path.display(), e),
            )
        })
    }

    /// Builder used by tests and by callers that assemble jobs in code.
    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    pub fn with_input(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputEntry {
                location: InputLocation { path: path.into() },
            },
        );
        self
    }

    pub fn input_path(&self, name: &str) -> Option<&Path> {
        self.inputs.get(name).map(|i| i.location.path.as_path())
    }

    /// Level requested through the job's `gear-log-level` option, lowercased.
    pub fn log_level(&self) -> Option<String> {
        self.config
            .get("gear-log-level")
            .and_then(|v| v.as_str())
            .map(|s| s.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn environment_derives_layout_from_base() {
        let env = GearEnvironment::from_base("/tmp/gear");
        assert_eq!(env.input_dir, PathBuf::from("/tmp/gear/input"));
        assert_eq!(env.output_dir, PathBuf::from("/tmp/gear/output"));
        assert_eq!(env.work_dir, PathBuf::from("/tmp/gear/work"));
        assert_eq!(env.config_path, PathBuf::from("/tmp/gear/config.json"));
        assert_eq!(env.manifest_path, PathBuf::from("/tmp/gear/manifest.json"));
        assert_eq!(
            GearEnvironment::default().base_dir,
            PathBuf::from(DEFAULT_BASE_DIR)
        );
    }

    #[test]
    fn job_config_parses_platform_document() {
        let doc = json!({
            "config": { "BET": "-f 0.3", "VENT": true, "gear-log-level": "DEBUG" },
            "inputs": {
                "NIFTI_1": {
                    "base": "file",
                    "location": { "path": "/flywheel/v0/input/NIFTI_1/t1.nii.gz", "name": "t1.nii.gz" },
                    "object": { "type": "nifti" }
                }
            },
            "destination": { "id": "5c0f", "type": "analysis" }
        });
        let job: JobConfig = serde_json::from_value(doc).expect("parse");
        assert_eq!(job.config.get("VENT"), Some(&json!(true)));
        assert_eq!(
            job.input_path("NIFTI_1"),
            Some(Path::new("/flywheel/v0/input/NIFTI_1/t1.nii.gz"))
        );
        assert_eq!(job.log_level().as_deref(), Some("debug"));
    }

    #[test]
    fn job_config_load_reports_unreadable_file() {
        let missing = std::env::temp_dir().join(format!(
            "siena_missing_config_{}.json",
            std::process::id()
        ));
        let err = JobConfig::load(&missing).expect_err("missing file");
        assert!(matches!(err, GearError::Configuration { ref field, .. } if field == "config.json"));
    }
}
