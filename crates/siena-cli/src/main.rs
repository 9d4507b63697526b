use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use siena_runner::config::DEFAULT_BASE_DIR;
use siena_runner::{
    parse_report_file, ExecutionResult, Gear, GearEnvironment, GearError, Invocation, JobConfig,
    OptionTable, ReportMetrics, RunOptions, SystemLauncher, ToolBinaries, UnknownKeyPolicy,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for failures outside the gear error taxonomy.
const INTERNAL_ERROR_EXIT: i32 = 5;

#[derive(Parser)]
#[command(
    name = "siena-gear",
    version,
    about = "FSL SIENA/SIENAX gear entry point",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    gear: GearArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Clone, Debug)]
struct GearArgs {
    /// Gear base directory holding input/, output/, config.json and manifest.json.
    #[arg(long, env = "FLYWHEEL", default_value = DEFAULT_BASE_DIR)]
    base_dir: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Directory the tool runs in and staged inputs are copied to.
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Reject config keys the option table does not know.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    timeout_secs: Option<u64>,
    #[arg(long, default_value = "siena")]
    siena_bin: String,
    #[arg(long, default_value = "sienax")]
    sienax_bin: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the job, run the tool and republish its outputs.
    Run {
        #[command(flatten)]
        gear: GearArgs,
        #[arg(long)]
        json: bool,
    },
    /// Validate the job and print the command that would run.
    Describe {
        #[command(flatten)]
        gear: GearArgs,
        #[arg(long)]
        json: bool,
    },
    /// Parse a report.siena or report.sienax file.
    ParseReport {
        report: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        gear: cli.gear,
        json: cli.json,
    });
    let json_mode = command_json_mode(&command);
    match run_command(command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let gear_err = err.downcast_ref::<GearError>();
            let exit = gear_err.map_or(INTERNAL_ERROR_EXIT, GearError::exit_code);
            if json_mode {
                let code = gear_err.map_or("command_failed", GearError::code);
                let details = gear_err.map_or_else(|| json!({}), error_details);
                emit_json(&json_error(code, format!("{:#}", err), details));
            }
            tracing::error!("{:#}", err);
            std::process::exit(exit);
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { gear, json } => {
            let (gear, job) = build_gear(&gear)?;
            tracing::info!("starting FSL SIENA/SIENAX gear");
            let result = gear.run(&job)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "result": serde_json::to_value(&result)?,
                })));
            }
            print_result(&result);
        }
        Commands::Describe { gear, json } => {
            let (gear, job) = build_gear(&gear)?;
            let invocation = gear.plan(&job)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "invocation": invocation_to_json(&invocation),
                })));
            }
            print_invocation(&invocation);
        }
        Commands::ParseReport { report, json } => {
            init_logging(None);
            let metrics = parse_report_file(&report)?.ok_or_else(|| {
                anyhow::anyhow!("not a SIENA/SIENAX report: {}", report.display())
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "parse-report",
                    "report": report.display().to_string(),
                    "metrics": metrics,
                })));
            }
            print_metrics(&metrics);
        }
    }
    Ok(None)
}

/// Load the job, start logging at the job's level, then assemble the gear.
fn build_gear(args: &GearArgs) -> Result<(Gear<SystemLauncher>, JobConfig)> {
    let mut env = GearEnvironment::from_base(&args.base_dir);
    if let Some(config) = &args.config {
        env.config_path = config.clone();
    }
    if let Some(manifest) = &args.manifest {
        env.manifest_path = manifest.clone();
    }
    if let Some(work_dir) = &args.work_dir {
        env.work_dir = work_dir.clone();
    }

    let job = JobConfig::load(&env.config_path);
    init_logging(job.as_ref().ok().and_then(JobConfig::log_level));
    let job = job?;

    let table = OptionTable::load_or_builtin(&env.manifest_path)?;
    let options = RunOptions {
        unknown_keys: if args.strict {
            UnknownKeyPolicy::Reject
        } else {
            UnknownKeyPolicy::Ignore
        },
        timeout: args.timeout_secs.map(Duration::from_secs),
        binaries: ToolBinaries {
            siena: args.siena_bin.clone(),
            sienax: args.sienax_bin.clone(),
        },
    };
    tracing::debug!(
        base_dir = %env.base_dir.display(),
        unknown_keys = options.unknown_keys.as_str(),
        "gear environment"
    );
    let launcher = SystemLauncher::in_dir(&env.work_dir);
    Ok((Gear::new(env, options, table, launcher), job))
}

/// `RUST_LOG` wins; otherwise the job's `gear-log-level`, otherwise info.
fn init_logging(job_level: Option<String>) {
    let level = match job_level.as_deref() {
        Some("debug") => "debug",
        Some("warning") | Some("warn") => "warn",
        Some("error") | Some("critical") => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &GearError) -> Value {
    match err {
        GearError::Configuration { field, .. } => json!({ "field": field }),
        GearError::Execution {
            tool,
            code,
            stdout,
            stderr,
        } => json!({
            "tool": tool,
            "exit_code": code,
            "stdout": stdout,
            "stderr": stderr,
        }),
        GearError::Postcondition { tool, missing } => json!({
            "tool": tool,
            "missing": missing.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
        }),
        GearError::Timeout {
            tool,
            after,
            stdout,
            stderr,
        } => json!({
            "tool": tool,
            "timeout_secs": after.as_secs(),
            "stdout": stdout,
            "stderr": stderr,
        }),
        GearError::Launch { program, .. } => json!({ "program": program }),
        GearError::Io(_) | GearError::Json(_) | GearError::Archive(_) => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::ParseReport { json, .. } => *json,
    }
}

fn invocation_to_json(invocation: &Invocation) -> Value {
    json!({
        "tool": invocation.mode.as_str(),
        "command": invocation.command.tokens(),
        "command_digest": invocation.command.digest(),
        "staging": invocation.staging.iter().map(|s| json!({
            "input": s.input,
            "from": s.from.display().to_string(),
            "to": s.to.display().to_string(),
        })).collect::<Vec<_>>(),
    })
}

fn print_invocation(invocation: &Invocation) {
    println!("tool: {}", invocation.mode.as_str());
    println!("command: {}", invocation.command.display());
    println!("command_digest: {}", invocation.command.digest());
    for staged in &invocation.staging {
        println!(
            "staged {}: {} -> {}",
            staged.input,
            staged.from.display(),
            staged.to.display()
        );
    }
}

fn print_result(result: &ExecutionResult) {
    println!("tool: {}", result.tool.as_str());
    println!("exit_code: {}", result.exit_code);
    println!("command_digest: {}", result.command_digest);
    if let Some(archive) = &result.archive {
        println!("archive: {}", archive.display());
    }
    for output in &result.outputs {
        println!("output: {}", output.display());
    }
    if let Some(metrics) = &result.metrics {
        print_metrics(metrics);
    }
}

fn print_metrics(metrics: &ReportMetrics) {
    match metrics {
        ReportMetrics::Siena(values) => {
            for (key, value) in values {
                println!("{}: {}", key, value);
            }
        }
        ReportMetrics::Sienax(volumes) => {
            for (key, tissue) in volumes {
                println!(
                    "{}: {} (unnormalised {})",
                    key, tissue.volume, tissue.unnormalised_volume
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_defaults_to_run() {
        let cli = Cli::try_parse_from(["siena-gear", "--base-dir", "/tmp/gear", "--strict"])
            .expect("parse");
        assert!(cli.command.is_none());
        assert_eq!(cli.gear.base_dir, PathBuf::from("/tmp/gear"));
        assert!(cli.gear.strict);
        assert_eq!(cli.gear.work_dir, None);
    }

    #[test]
    fn work_dir_overrides_the_base_layout() {
        let cli = Cli::try_parse_from([
            "siena-gear",
            "run",
            "--base-dir",
            "/tmp/gear",
            "--work-dir",
            "/scratch/siena",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Run { gear, .. }) => {
                assert_eq!(gear.work_dir, Some(PathBuf::from("/scratch/siena")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn subcommands_take_their_own_gear_args() {
        let cli = Cli::try_parse_from([
            "siena-gear",
            "describe",
            "--base-dir",
            "/tmp/gear",
            "--sienax-bin",
            "sienax_optibet",
            "--json",
        ])
        .expect("parse");
        match cli.command {
            Some(Commands::Describe { gear, json }) => {
                assert!(json);
                assert_eq!(gear.sienax_bin, "sienax_optibet");
                assert_eq!(gear.siena_bin, "siena");
            }
            _ => panic!("expected describe"),
        }
    }

    #[test]
    fn error_details_expose_exit_code_and_missing_files() {
        let exec = GearError::Execution {
            tool: "siena".into(),
            code: Some(2),
            stdout: String::new(),
            stderr: "boom\n".into(),
        };
        assert_eq!(error_details(&exec)["exit_code"], json!(2));

        let post = GearError::Postcondition {
            tool: "sienax".into(),
            missing: vec![PathBuf::from("/out/report.sienax")],
        };
        assert_eq!(
            error_details(&post)["missing"],
            json!(["/out/report.sienax"])
        );
    }

    #[test]
    fn json_error_envelope_matches_runner_contract() {
        let payload = json_error("configuration_error", "bad".into(), json!({"field": "TOP"}));
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("configuration_error"));
        assert_eq!(payload["error"]["details"]["field"], json!("TOP"));
    }
}
