use std::path::PathBuf;
use std::time::Duration;

/// Every way a gear invocation can fail. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum GearError {
    #[error("invalid configuration for {field}: {message}")]
    Configuration { field: String, message: String },

    #[error("{tool} exited with {}: {}", describe_code(*code), tail(stderr))]
    Execution {
        tool: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{tool} reported success but expected outputs are missing: {}", join_paths(missing))]
    Postcondition { tool: String, missing: Vec<PathBuf> },

    #[error("{tool} did not finish within {}s and was terminated", after.as_secs())]
    Timeout {
        tool: String,
        after: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to archive outputs: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl GearError {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Process exit code for the container entry point.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 1,
            Self::Execution { .. } => 2,
            Self::Postcondition { .. } => 3,
            Self::Timeout { .. } => 4,
            Self::Launch { .. } | Self::Io(_) | Self::Json(_) | Self::Archive(_) => 5,
        }
    }

    /// Stable machine-readable identifier, used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Execution { .. } => "execution_error",
            Self::Postcondition { .. } => "postcondition_error",
            Self::Timeout { .. } => "timeout_error",
            Self::Launch { .. } => "launch_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Archive(_) => "archive_error",
        }
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "a signal".to_string(),
    }
}

/// Last non-empty line of captured stderr.
pub(crate) fn tail(stderr: &str) -> &str {
    stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("no output on stderr")
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
