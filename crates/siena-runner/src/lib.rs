//! Container entry point logic for the FSL SIENA/SIENAX gear.
//!
//! [`Gear::run`] validates a job, builds the tool command line, runs it
//! through a [`ProcessLauncher`] and republishes the tool's outputs.

pub mod command;
pub mod config;
pub mod error;
pub mod launcher;
pub mod options;
pub mod outputs;
pub mod report;

pub use command::{CommandLine, Invocation, ToolMode};
pub use config::{GearEnvironment, JobConfig, RunOptions, ToolBinaries, UnknownKeyPolicy};
pub use error::GearError;
pub use launcher::{ProcessLauncher, ProcessOutput, SystemLauncher};
pub use options::OptionTable;
pub use report::{parse_report_file, ReportMetrics};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

/// Terminal record of a successful invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub tool: ToolMode,
    pub command: Vec<String>,
    pub command_digest: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub outputs: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    pub metrics: Option<ReportMetrics>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct Gear<L> {
    env: GearEnvironment,
    options: RunOptions,
    table: OptionTable,
    launcher: L,
}

impl<L: ProcessLauncher> Gear<L> {
    pub fn new(env: GearEnvironment, options: RunOptions, table: OptionTable, launcher: L) -> Self {
        Self {
            env,
            options,
            table,
            launcher,
        }
    }

    /// Validate `job` and build its invocation. Reads inputs, writes nothing.
    pub fn plan(&self, job: &JobConfig) -> Result<Invocation, GearError> {
        let mode = ToolMode::select(job)?;
        tracing::info!(tool = mode.as_str(), "getting configuration");
        command::validate_inputs(job, mode)?;
        command::plan_invocation(&self.env, &self.options, &self.table, job)
    }

    /// Run the tool once for `job`. Failures are returned, never retried.
    pub fn run(&self, job: &JobConfig) -> Result<ExecutionResult, GearError> {
        let invocation = self.plan(job)?;
        let mode = invocation.mode;
        command::stage_inputs(&invocation)?;
        fs::create_dir_all(&self.env.output_dir)?;
        fs::create_dir_all(&self.env.work_dir)?;

        tracing::info!(
            tool = mode.as_str(),
            command = %invocation.command.display(),
            "running"
        );
        let started_at = Utc::now();
        let output = self
            .launcher
            .launch(&invocation.command, self.options.timeout)?;
        let finished_at = Utc::now();

        if output.timed_out {
            return Err(GearError::Timeout {
                tool: mode.as_str().to_string(),
                after: self.options.timeout.unwrap_or_default(),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        let exit_code = match output.code {
            Some(0) => 0,
            code => {
                tracing::error!(tool = mode.as_str(), code = ?code, "tool did not execute successfully");
                return Err(GearError::Execution {
                    tool: mode.as_str().to_string(),
                    code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                });
            }
        };

        outputs::check_expected_outputs(&self.env.output_dir, mode)?;
        let republished = outputs::republish(&self.env.output_dir, &self.env.input_dir, mode)?;
        tracing::info!(
            tool = mode.as_str(),
            outputs = republished.outputs.len(),
            "completed successfully"
        );

        Ok(ExecutionResult {
            tool: mode,
            command: invocation.command.tokens(),
            command_digest: invocation.command.digest(),
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            outputs: republished.outputs,
            archive: republished.archive,
            metrics: republished.metrics,
            started_at,
            finished_at,
        })
    }
}
