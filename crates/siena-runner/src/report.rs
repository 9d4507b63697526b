//! Metrics parsed from `report.siena` and `report.sienax`.

use crate::error::GearError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const SIENA_KEYS: &[&str] = &["AREA", "VOLC", "RATIO", "PBVC", "finalPBVC"];
const SIENAX_KEYS: &[&str] = &["GREY", "WHITE", "BRAIN"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TissueVolume {
    pub volume: f64,
    #[serde(rename = "unnormalised-volume")]
    pub unnormalised_volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReportMetrics {
    /// Per-pass values; the two registration directions are numbered 1 and 2.
    Siena(BTreeMap<String, f64>),
    Sienax(BTreeMap<String, TissueVolume>),
}

impl ReportMetrics {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Siena(m) => m.is_empty(),
            Self::Sienax(m) => m.is_empty(),
        }
    }
}

/// Parse a report file. Returns `Ok(None)` for files that are not a SIENA or
/// SIENAX report.
pub fn parse_report_file(path: &Path) -> Result<Option<ReportMetrics>, GearError> {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    let text = fs::read_to_string(path)?;
    match name {
        "report.siena" => Ok(Some(parse_siena(&text))),
        "report.sienax" => Ok(Some(parse_sienax(&text))),
        other => {
            tracing::warn!(report = other, "unrecognised report name");
            Ok(None)
        }
    }
}

pub fn parse_siena(text: &str) -> ReportMetrics {
    let mut metrics = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(raw)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !SIENA_KEYS.contains(&key) {
            continue;
        }
        let Some(value) = parse_number(key, raw) else {
            continue;
        };
        let name = if key == "finalPBVC" {
            key.to_string()
        } else if metrics.contains_key(&format!("{}1", key)) {
            format!("{}2", key)
        } else {
            format!("{}1", key)
        };
        metrics.insert(name, value);
    }
    ReportMetrics::Siena(metrics)
}

pub fn parse_sienax(text: &str) -> ReportMetrics {
    let mut metrics = BTreeMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [key, volume, unnormalised, ..] = fields.as_slice() else {
            continue;
        };
        if !SIENAX_KEYS.contains(key) {
            continue;
        }
        let (Some(volume), Some(unnormalised_volume)) =
            (parse_number(key, volume), parse_number(key, unnormalised))
        else {
            continue;
        };
        metrics.insert(
            key.to_string(),
            TissueVolume {
                volume,
                unnormalised_volume,
            },
        );
    }
    ReportMetrics::Sienax(metrics)
}

fn parse_number(key: &str, raw: &str) -> Option<f64> {
    match raw.parse::<f64>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = raw, "skipping non-numeric report value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SIENA_REPORT: &str = "\
siena /data/a.nii /data/b.nii -o /out
----------  register and extract baseline  ----------
AREA  120034.5
VOLC  -2343.12
RATIO 1.0021
PBVC  -0.412
----------  reverse direction  ----------
AREA  119877.0
VOLC  2123.00
RATIO 0.9981
PBVC  0.388
finalPBVC -0.400
";

    const SIENAX_REPORT: &str = "\
sienax /data/t1.nii -o /out
VSCALING 1.3142
tissue             volume    unnormalised-volume
pgrey              611287.48  465136.42 (peripheral grey)
vcsf               42371.81   32241.45 (ventricular CSF)
GREY               785312.37  597553.48
WHITE              702108.52  534240.92
BRAIN              1487420.89 1131794.40
";

    #[test]
    fn siena_report_numbers_both_passes() {
        let metrics = parse_siena(SIENA_REPORT);
        let value = serde_json::to_value(&metrics).expect("serialize");
        assert_eq!(
            value,
            json!({
                "AREA1": 120034.5, "AREA2": 119877.0,
                "VOLC1": -2343.12, "VOLC2": 2123.0,
                "RATIO1": 1.0021, "RATIO2": 0.9981,
                "PBVC1": -0.412, "PBVC2": 0.388,
                "finalPBVC": -0.4
            })
        );
    }

    #[test]
    fn sienax_report_keeps_tissue_volumes() {
        let metrics = parse_sienax(SIENAX_REPORT);
        let ReportMetrics::Sienax(map) = &metrics else {
            panic!("expected sienax metrics");
        };
        assert_eq!(map.len(), 3);
        assert_eq!(
            map.get("BRAIN"),
            Some(&TissueVolume {
                volume: 1487420.89,
                unnormalised_volume: 1131794.40
            })
        );
        let value = serde_json::to_value(&metrics).expect("serialize");
        assert_eq!(value["GREY"]["unnormalised-volume"], json!(597553.48));
    }

    #[test]
    fn malformed_values_are_skipped() {
        let metrics = parse_siena("PBVC  n/a\nfinalPBVC -0.1\n");
        assert_eq!(
            metrics,
            ReportMetrics::Siena(BTreeMap::from([("finalPBVC".to_string(), -0.1)]))
        );
        assert!(parse_sienax("GREY 1.0\n").is_empty());
    }

    #[test]
    fn unknown_report_names_yield_none() {
        let path = std::env::temp_dir().join(format!(
            "siena_report_unknown_{}.txt",
            std::process::id()
        ));
        fs::write(&path, SIENA_REPORT).expect("write");
        assert_eq!(parse_report_file(&path).expect("parse"), None);
        let _ = fs::remove_file(path);
    }
}
