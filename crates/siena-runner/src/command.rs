use crate::config::{GearEnvironment, JobConfig, RunOptions};
use crate::error::GearError;
use crate::options::OptionTable;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const INPUT_BASELINE: &str = "NIFTI_1";
pub const INPUT_FOLLOWUP: &str = "NIFTI_2";
pub const INPUT_SINGLE: &str = "NIFTI";
pub const INPUT_VENTRICLE_MASK: &str = "ventricle_mask";
pub const INPUT_LESION_MASK: &str = "lesion_mask";

const NIFTI1_HEADER_SIZE: i32 = 348;
const NIFTI2_HEADER_SIZE: i32 = 540;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolMode {
    /// Two-timepoint atrophy estimation.
    Siena,
    /// Single-timepoint brain volume estimation.
    Sienax,
}

impl ToolMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Siena => "siena",
            Self::Sienax => "sienax",
        }
    }

    /// Inputs passed positionally, in order.
    pub fn primary_inputs(&self) -> &'static [&'static str] {
        match self {
            Self::Siena => &[INPUT_BASELINE, INPUT_FOLLOWUP],
            Self::Sienax => &[INPUT_SINGLE],
        }
    }

    pub fn report_name(&self) -> String {
        format!("report.{}", self.as_str())
    }

    /// Pick the tool from the declared inputs: two timepoints run SIENA, a
    /// single image runs SIENAX.
    pub fn select(job: &JobConfig) -> Result<Self, GearError> {
        let has = |name: &str| job.inputs.contains_key(name);
        if has(INPUT_BASELINE) && has(INPUT_FOLLOWUP) {
            Ok(Self::Siena)
        } else if has(INPUT_SINGLE) {
            Ok(Self::Sienax)
        } else {
            Err(GearError::configuration(
                "inputs",
                format!(
                    "expected {} and {} (siena) or {} (sienax)",
                    INPUT_BASELINE, INPUT_FOLLOWUP, INPUT_SINGLE
                ),
            ))
        }
    }
}

/// Program plus argument tokens, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn tokens(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-quoted rendering for logs.
    pub fn display(&self) -> String {
        shell_join(&self.tokens())
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for token in self.tokens() {
            hasher.update(token.as_bytes());
            hasher.update([0u8]);
        }
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }
}

/// An input whose filename had to be rewritten before the tool can read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedCopy {
    pub input: String,
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    pub mode: ToolMode,
    pub command: CommandLine,
    pub staging: Vec<StagedCopy>,
}

/// Build the invocation for `job` without touching the filesystem.
///
/// Token order: program, primary inputs, options in table order, mask flag and
/// path, then `-o <output_dir>`.
pub fn plan_invocation(
    env: &GearEnvironment,
    options: &RunOptions,
    table: &OptionTable,
    job: &JobConfig,
) -> Result<Invocation, GearError> {
    let mode = ToolMode::select(job)?;
    let mut staging = Vec::new();
    let mut args = Vec::new();

    for name in mode.primary_inputs() {
        let path = required_input(job, name)?;
        args.push(stage_path(env, name, path, &mut staging));
    }

    let option_tokens = table.translate(&job.config, mode, options.unknown_keys)?;
    let vent_enabled = job
        .config
        .get("VENT")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    args.extend(option_tokens);

    match mode {
        ToolMode::Siena => {
            if let Some(mask) = job.input_path(INPUT_VENTRICLE_MASK) {
                if !vent_enabled {
                    return Err(GearError::configuration(
                        INPUT_VENTRICLE_MASK,
                        "ventricle mask provided without enabling VENT",
                    ));
                }
                args.push("-v".to_string());
                args.push(stage_path(env, INPUT_VENTRICLE_MASK, mask, &mut staging));
            }
            if job.inputs.contains_key(INPUT_LESION_MASK) {
                tracing::warn!("lesion_mask only applies to sienax; ignoring");
            }
        }
        ToolMode::Sienax => {
            if let Some(mask) = job.input_path(INPUT_LESION_MASK) {
                args.push("-lm".to_string());
                args.push(stage_path(env, INPUT_LESION_MASK, mask, &mut staging));
            }
            if job.inputs.contains_key(INPUT_VENTRICLE_MASK) {
                tracing::warn!("ventricle_mask only applies to siena; ignoring");
            }
        }
    }

    args.push("-o".to_string());
    args.push(env.output_dir.to_string_lossy().to_string());

    let program = match mode {
        ToolMode::Siena => options.binaries.siena.clone(),
        ToolMode::Sienax => options.binaries.sienax.clone(),
    };
    Ok(Invocation {
        mode,
        command: CommandLine::new(program, args),
        staging,
    })
}

/// Check every input the selected tool will read.
pub fn validate_inputs(job: &JobConfig, mode: ToolMode) -> Result<(), GearError> {
    let masks: &[&str] = match mode {
        ToolMode::Siena => &[INPUT_VENTRICLE_MASK],
        ToolMode::Sienax => &[INPUT_LESION_MASK],
    };
    for name in mode.primary_inputs() {
        validate_image(name, required_input(job, name)?)?;
    }
    for name in masks {
        if let Some(path) = job.input_path(name) {
            validate_image(name, path)?;
        }
    }
    Ok(())
}

/// Copy inputs with whitespace in their names to the paths the command uses.
pub fn stage_inputs(invocation: &Invocation) -> Result<(), GearError> {
    for copy in &invocation.staging {
        if let Some(parent) = copy.to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&copy.from, &copy.to)?;
        tracing::info!(
            input = %copy.input,
            from = %copy.from.display(),
            to = %copy.to.display(),
            "filename contains spaces; staged copy"
        );
    }
    Ok(())
}

fn required_input<'a>(job: &'a JobConfig, name: &str) -> Result<&'a Path, GearError> {
    job.input_path(name)
        .ok_or_else(|| GearError::configuration(name, "required input missing"))
}

fn stage_path(
    env: &GearEnvironment,
    name: &str,
    path: &Path,
    staging: &mut Vec<StagedCopy>,
) -> String {
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if !file_name.contains(' ') {
        return path.to_string_lossy().to_string();
    }
    let to = env.work_dir.join(name).join(file_name.replace(' ', "_"));
    staging.push(StagedCopy {
        input: name.to_string(),
        from: path.to_path_buf(),
        to: to.clone(),
    });
    to.to_string_lossy().to_string()
}

fn validate_image(name: &str, path: &Path) -> Result<(), GearError> {
    let meta = fs::metadata(path).map_err(|e| {
        GearError::configuration(name, format!("cannot access {}: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(GearError::configuration(
            name,
            format!("{} is not a regular file", path.display()),
        ));
    }
    let mut file = fs::File::open(path).map_err(|e| {
        GearError::configuration(name, format!("cannot read {}: {}", path.display(), e))
    })?;

    let lower = path.to_string_lossy().to_ascii_lowercase();
    if lower.ends_with(".gz") {
        let mut magic = [0u8; 2];
        if file.read_exact(&mut magic).is_err() || magic != GZIP_MAGIC {
            return Err(GearError::configuration(
                name,
                format!("{} is not gzip-compressed", path.display()),
            ));
        }
    } else if lower.ends_with(".nii") {
        let mut header = Vec::with_capacity(NIFTI1_HEADER_SIZE as usize);
        file.take(NIFTI1_HEADER_SIZE as u64)
            .read_to_end(&mut header)?;
        if !is_nifti_header(&header) {
            return Err(GearError::configuration(
                name,
                format!("{} is not a valid NIfTI image", path.display()),
            ));
        }
    }
    tracing::info!(input = name, path = %path.display(), "input validated");
    Ok(())
}

fn is_nifti_header(header: &[u8]) -> bool {
    if header.len() < 12 {
        return false;
    }
    let raw = [header[0], header[1], header[2], header[3]];
    let sizes = [i32::from_le_bytes(raw), i32::from_be_bytes(raw)];
    if sizes.contains(&NIFTI1_HEADER_SIZE) {
        return header.len() >= NIFTI1_HEADER_SIZE as usize
            && matches!(&header[344..348], b"n+1\0" | b"ni1\0");
    }
    if sizes.contains(&NIFTI2_HEADER_SIZE) {
        return matches!(&header[4..8], b"n+2\0" | b"ni2\0");
    }
    false
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Minimal single-file NIfTI-1 header, enough to pass [`validate_inputs`].
#[cfg(test)]
pub(crate) fn nifti1_header() -> Vec<u8> {
    let mut header = vec![0u8; NIFTI1_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&NIFTI1_HEADER_SIZE.to_le_bytes());
    header[344..348].copy_from_slice(b"n+1\0");
    header
}
