//! Mapping from job configuration keys to tool command-line flags.
//!
//! The table is ordered; that order is the order options appear on the
//! command line. The built-in table follows the SIENA/SIENAX usage text. A
//! table derived from the gear manifest is ordered by key.

use crate::command::ToolMode;
use crate::config::UnknownKeyPolicy;
use crate::error::GearError;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Keys whose values are passed through to a nested tool and must arrive as a
/// single double-quoted token.
const QUOTED_KEYS: &[&str] = &["BET", "S_DIFF", "S_FAST"];
/// Keys holding a coordinate in mm.
const NUMERIC_KEYS: &[&str] = &["TOP", "BOTTOM"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Boolean,
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    pub key: String,
    /// `None` for keys the platform consumes itself (e.g. `gear-log-level`).
    pub flag: Option<String>,
    pub kind: OptionKind,
    pub quoted: bool,
    /// `None` when the option is valid for both tools.
    pub tool: Option<ToolMode>,
}

impl OptionSpec {
    fn new(key: &str, flag: Option<&str>, kind: OptionKind, tool: Option<ToolMode>) -> Self {
        Self {
            key: key.to_string(),
            flag: flag.map(str::to_string),
            kind,
            quoted: QUOTED_KEYS.contains(&key),
            tool,
        }
    }

    fn applies_to(&self, mode: ToolMode) -> bool {
        self.tool.map_or(true, |t| t == mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionTable {
    specs: Vec<OptionSpec>,
}

#[derive(Debug, Deserialize)]
struct GearManifest {
    #[serde(default)]
    config: BTreeMap<String, ManifestOption>,
}

#[derive(Debug, Deserialize)]
struct ManifestOption {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    value_type: String,
}

impl OptionTable {
    pub fn builtin() -> Self {
        let siena = Some(ToolMode::Siena);
        let sienax = Some(ToolMode::Sienax);
        Self {
            specs: vec![
                OptionSpec::new("DEBUG", Some("-d"), OptionKind::Boolean, None),
                OptionSpec::new("BET", Some("-B"), OptionKind::String, None),
                OptionSpec::new("TWO_CLASS", Some("-2"), OptionKind::Boolean, None),
                OptionSpec::new("T2", Some("-t2"), OptionKind::Boolean, None),
                OptionSpec::new("STD_MASK", Some("-m"), OptionKind::Boolean, siena),
                OptionSpec::new("TOP", Some("-t"), OptionKind::Number, None),
                OptionSpec::new("BOTTOM", Some("-b"), OptionKind::Number, None),
                OptionSpec::new("S_DIFF", Some("-S"), OptionKind::String, siena),
                OptionSpec::new("VENT", Some("-V"), OptionKind::Boolean, siena),
                OptionSpec::new("REGIONAL", Some("-r"), OptionKind::Boolean, sienax),
                OptionSpec::new("S_FAST", Some("-S"), OptionKind::String, sienax),
                OptionSpec::new("gear-log-level", None, OptionKind::String, None),
            ],
        }
    }

    /// Derive the table from a gear `manifest.json`.
    ///
    /// Entries whose `id` is not a short flag are recognised but never
    /// forwarded. Tool applicability is taken from the built-in table for keys
    /// it knows.
    pub fn from_manifest(path: &Path) -> Result<Self, GearError> {
        let data = fs::read_to_string(path).map_err(|e| {
            GearError::configuration(
                "manifest.json",
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        let manifest: GearManifest = serde_json::from_str(&data).map_err(|e| {
            GearError::configuration(
                "manifest.json",
                format!("cannot parse {}: {}", path.display(), e),
            )
        })?;
        let builtin = Self::builtin();
        let mut specs = Vec::with_capacity(manifest.config.len());
        for (key, opt) in manifest.config {
            let kind = match opt.value_type.as_str() {
                "boolean" => OptionKind::Boolean,
                "string" if NUMERIC_KEYS.contains(&key.as_str()) => OptionKind::Number,
                "string" => OptionKind::String,
                "number" | "integer" => OptionKind::Number,
                other => {
                    return Err(GearError::configuration(
                        key,
                        format!("unsupported manifest type '{}'", other),
                    ))
                }
            };
            let flag = opt.id.filter(|id| flag_pattern().is_match(id));
            let tool = builtin.get(&key).and_then(|s| s.tool);
            specs.push(OptionSpec {
                quoted: QUOTED_KEYS.contains(&key.as_str()),
                key,
                flag,
                kind,
                tool,
            });
        }
        Ok(Self { specs })
    }

    /// Manifest table when the manifest exists, built-in table otherwise.
    pub fn load_or_builtin(manifest_path: &Path) -> Result<Self, GearError> {
        if manifest_path.exists() {
            Self::from_manifest(manifest_path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn get(&self, key: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|s| s.key == key)
    }

    pub fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    /// Validate every configured value and produce the option tokens for
    /// `mode`, in table order.
    pub fn translate(
        &self,
        config: &BTreeMap<String, Value>,
        mode: ToolMode,
        policy: UnknownKeyPolicy,
    ) -> Result<Vec<String>, GearError> {
        for key in config.keys() {
            if self.get(key).is_none() {
                match policy {
                    UnknownKeyPolicy::Reject => {
                        return Err(GearError::configuration(
                            key.as_str(),
                            "unrecognised option",
                        ))
                    }
                    UnknownKeyPolicy::Ignore => {
                        tracing::warn!(key = %key, "ignoring unrecognised option");
                    }
                }
            }
        }

        let mut tokens = Vec::new();
        for spec in &self.specs {
            let Some(value) = config.get(&spec.key) else {
                continue;
            };
            let rendered = render_value(spec, value)?;
            let (Some(flag), Some(rendered)) = (spec.flag.as_ref(), rendered) else {
                continue;
            };
            if !spec.applies_to(mode) {
                tracing::debug!(key = %spec.key, tool = mode.as_str(), "option does not apply to tool");
                continue;
            }
            tokens.push(flag.clone());
            if let Some(arg) = rendered {
                tokens.push(arg);
            }
        }
        Ok(tokens)
    }
}

/// `Ok(None)` means the option is unset; `Ok(Some(None))` a bare flag.
fn render_value(spec: &OptionSpec, value: &Value) -> Result<Option<Option<String>>, GearError> {
    if value.is_null() {
        return Ok(None);
    }
    match spec.kind {
        OptionKind::Boolean => match value {
            Value::Bool(true) => Ok(Some(None)),
            Value::Bool(false) => Ok(None),
            other => Err(type_mismatch(spec, "boolean", other)),
        },
        OptionKind::String => match value {
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) if spec.quoted && !s.starts_with('"') => {
                Ok(Some(Some(format!("\"{}\"", s))))
            }
            Value::String(s) => Ok(Some(Some(s.clone()))),
            other => Err(type_mismatch(spec, "string", other)),
        },
        OptionKind::Number => match value {
            Value::Number(n) => Ok(Some(Some(n.to_string()))),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => {
                let s = s.trim();
                if number_pattern().is_match(s) {
                    Ok(Some(Some(s.to_string())))
                } else {
                    Err(GearError::configuration(
                        spec.key.as_str(),
                        format!("value '{}' is not a number", s),
                    ))
                }
            }
            other => Err(type_mismatch(spec, "number", other)),
        },
    }
}

fn type_mismatch(spec: &OptionSpec, expected: &str, got: &Value) -> GearError {
    GearError::configuration(
        spec.key.as_str(),
        format!("expected {}, got {}", expected, value_type_name(got)),
    )
}

fn value_type_name(value: &Value) -> &'static str {
    if value.is_string() {
        "string"
    } else if value.is_boolean() {
        "boolean"
    } else if value.is_number() {
        "number"
    } else if value.is_array() {
        "array"
    } else if value.is_object() {
        "object"
    } else {
        "null"
    }
}

fn flag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^-[a-zA-Z0-9]{1,2}$").expect("valid flag regex"))
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[-+]?[0-9]+(\.[0-9]+)?$").expect("valid number regex"))
}
