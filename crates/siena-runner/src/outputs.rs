use crate::command::ToolMode;
use crate::error::GearError;
use crate::report::{parse_report_file, ReportMetrics};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use regex::{Captures, Regex};
use serde_json::json;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const REPORT_HTML: &str = "report.html";
pub const METADATA_FILE: &str = ".metadata.json";

/// Output directory state after republishing.
#[derive(Debug, Clone, PartialEq)]
pub struct Republished {
    pub outputs: Vec<PathBuf>,
    pub archive: Option<PathBuf>,
    pub metrics: Option<ReportMetrics>,
}

/// Files the tool must leave behind when it exits zero.
pub fn expected_outputs(output_dir: &Path, mode: ToolMode) -> Vec<PathBuf> {
    vec![output_dir.join(mode.report_name()), output_dir.join(REPORT_HTML)]
}

pub fn check_expected_outputs(output_dir: &Path, mode: ToolMode) -> Result<(), GearError> {
    let missing: Vec<PathBuf> = expected_outputs(output_dir, mode)
        .into_iter()
        .filter(|p| !p.is_file())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GearError::Postcondition {
            tool: mode.as_str().to_string(),
            missing,
        })
    }
}

/// Reshape a successful run's output directory for the platform.
pub fn republish(
    output_dir: &Path,
    input_dir: &Path,
    mode: ToolMode,
) -> Result<Republished, GearError> {
    let html = output_dir.join(REPORT_HTML);
    embed_report_images(&html)?;
    scrub_report(&html, input_dir)?;

    let report_name = mode.report_name();
    let promote = [report_name.as_str(), REPORT_HTML, METADATA_FILE];
    let archive = archive_outputs(output_dir, &format!("{}_outputs", mode.as_str()), &promote)?;

    let report_path = output_dir.join(&report_name);
    let metrics = parse_report_file(&report_path)?.filter(|m| !m.is_empty());
    if let Some(metrics) = &metrics {
        let rendered = serde_json::to_string(metrics)?;
        tracing::info!(results = %rendered, "report metrics");
        write_metadata(output_dir, metrics)?;
        let renamed = output_dir.join(format!("{}.log", report_name));
        fs::rename(&report_path, &renamed)?;
    } else {
        tracing::warn!(report = %report_path.display(), "no metrics found in report");
    }

    Ok(Republished {
        outputs: list_outputs(output_dir)?,
        archive,
        metrics,
    })
}

/// Inline every resolvable `<img src>` in the report as a data URI.
pub fn embed_report_images(html_path: &Path) -> Result<(), GearError> {
    let html = match fs::read_to_string(html_path) {
        Ok(h) => h,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %html_path.display(), "report not found; leaving html untouched");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let base = html_path.parent().unwrap_or_else(|| Path::new("."));
    let mut failure = None;
    let embedded = img_src_pattern().replace_all(&html, |caps: &Captures| {
        let src = &caps[3];
        if src.starts_with("data:") {
            return caps[0].to_string();
        }
        let candidate = if Path::new(src).is_absolute() {
            PathBuf::from(src)
        } else {
            base.join(src)
        };
        if !candidate.is_file() {
            tracing::warn!(image = src, "could not locate image; leaving src as is");
            return caps[0].to_string();
        }
        match fs::read(&candidate) {
            Ok(bytes) => format!(
                "{}{}data:{};base64,{}{}",
                &caps[1],
                &caps[2],
                mime_for(&candidate),
                STANDARD.encode(bytes),
                &caps[4]
            ),
            Err(e) => {
                failure.get_or_insert(e);
                caps[0].to_string()
            }
        }
    });
    if let Some(e) = failure {
        return Err(e.into());
    }
    let embedded = embedded.replace('\u{a0}', " ");
    atomic_write_bytes(html_path, embedded.as_bytes())
}

/// Strip input directories from report text (the invocation line excepted)
/// and drop `<a>`/`<link>` tags, keeping what they wrap.
pub fn scrub_report(html_path: &Path, input_dir: &Path) -> Result<(), GearError> {
    let html = fs::read_to_string(html_path)?;
    let input_dir = input_dir.to_string_lossy();
    let dir_pattern = Regex::new(&format!(
        r"{}/\S*/",
        regex::escape(input_dir.trim_end_matches('/'))
    ))
    .map_err(|e| GearError::configuration("input_dir", e.to_string()))?;

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    for tag in tag_pattern().find_iter(&html) {
        out.push_str(&scrub_text(&html[cursor..tag.start()], &dir_pattern));
        if !link_tag_pattern().is_match(tag.as_str()) {
            out.push_str(tag.as_str());
        }
        cursor = tag.end();
    }
    out.push_str(&scrub_text(&html[cursor..], &dir_pattern));
    atomic_write_bytes(html_path, out.as_bytes())
}

fn scrub_text(text: &str, dir_pattern: &Regex) -> String {
    if text.trim_start().starts_with("siena") {
        return text.to_string();
    }
    dir_pattern.replace_all(text, "").into_owned()
}

/// Move every top-level file except `promote` into `<archive_name>.zip`.
pub fn archive_outputs(
    dir: &Path,
    archive_name: &str,
    promote: &[&str],
) -> Result<Option<PathBuf>, GearError> {
    let zip_name = format!("{}.zip", archive_name);
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type().is_file() || promote.contains(&name.as_str()) || name == zip_name {
            continue;
        }
        files.push((name, entry.into_path()));
    }
    if files.is_empty() {
        tracing::debug!(dir = %dir.display(), "nothing to archive");
        return Ok(None);
    }

    let zip_path = dir.join(&zip_name);
    let mut zip = zip::ZipWriter::new(fs::File::create(&zip_path)?);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, path) in &files {
        zip.start_file(name.as_str(), options)?;
        let mut source = fs::File::open(path)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    for (_, path) in &files {
        fs::remove_file(path)?;
    }
    tracing::info!(archive = %zip_path.display(), files = files.len(), "archived outputs");
    Ok(Some(zip_path))
}

pub fn write_metadata(output_dir: &Path, metrics: &ReportMetrics) -> Result<(), GearError> {
    let payload = json!({ "analysis": { "info": metrics } });
    let bytes = serde_json::to_vec_pretty(&payload)?;
    atomic_write_bytes(&output_dir.join(METADATA_FILE), &bytes)
}

/// Every regular file below `dir`, sorted.
pub fn list_outputs(dir: &Path) -> Result<Vec<PathBuf>, GearError> {
    let mut outputs = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            outputs.push(entry.into_path());
        }
    }
    Ok(outputs)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<(), GearError> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

fn img_src_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(["'])([^"']*)(["'])"#)
            .expect("valid img regex")
    })
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag regex"))
}

fn link_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^</?(a|link)\b").expect("valid link regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "siena_outputs_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn missing_artifacts_are_a_postcondition_error() {
        let root = temp_root("post");
        fs::write(root.join("report.siena"), "PBVC 0.1\n").expect("report");
        let err = check_expected_outputs(&root, ToolMode::Siena).expect_err("no html");
        match err {
            GearError::Postcondition { tool, missing } => {
                assert_eq!(tool, "siena");
                assert_eq!(missing, vec![root.join(REPORT_HTML)]);
            }
            other => panic!("unexpected error: {}", other),
        }
        fs::write(root.join(REPORT_HTML), "<html></html>").expect("html");
        check_expected_outputs(&root, ToolMode::Siena).expect("complete");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn images_are_inlined_as_data_uris() {
        let root = temp_root("embed");
        fs::write(root.join("A_halfwayto_B.png"), [1u8, 2, 3]).expect("png");
        let html = root.join(REPORT_HTML);
        fs::write(
            &html,
            "<p>a\u{a0}b</p><IMG SRC=\"A_halfwayto_B.png\" width=100><img src='missing.gif'>",
        )
        .expect("html");

        embed_report_images(&html).expect("embed");
        let out = fs::read_to_string(&html).expect("read");
        assert!(out.contains("<p>a b</p>"), "{}", out);
        assert!(
            out.contains("SRC=\"data:image/png;base64,AQID\" width=100"),
            "{}",
            out
        );
        assert!(out.contains("<img src='missing.gif'>"), "{}", out);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_report_html_is_not_fatal_for_embedding() {
        let root = temp_root("embed_missing");
        embed_report_images(&root.join(REPORT_HTML)).expect("tolerated");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scrub_strips_input_dirs_and_links() {
        let root = temp_root("scrub");
        let html = root.join(REPORT_HTML);
        fs::write(
            &html,
            concat!(
                "<link rel=\"stylesheet\" href=\"fsl.css\">",
                "<pre>siena /flywheel/v0/input/NIFTI_1/a.nii /flywheel/v0/input/NIFTI_2/b.nii</pre>",
                "<p>input: /flywheel/v0/input/NIFTI_1/sub/a.nii</p>",
                "<a href=\"http://fsl/wiki\">FSL wiki</a>"
            ),
        )
        .expect("html");

        scrub_report(&html, Path::new("/flywheel/v0/input")).expect("scrub");
        let out = fs::read_to_string(&html).expect("read");
        assert_eq!(
            out,
            concat!(
                "<pre>siena /flywheel/v0/input/NIFTI_1/a.nii /flywheel/v0/input/NIFTI_2/b.nii</pre>",
                "<p>input: a.nii</p>",
                "FSL wiki"
            )
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn archive_moves_everything_but_promoted_files() {
        let root = temp_root("archive");
        for name in ["report.siena", REPORT_HTML, "A_brain.nii.gz", "B_brain.nii.gz"] {
            fs::write(root.join(name), name.as_bytes()).expect("write");
        }
        fs::create_dir_all(root.join("nested")).expect("subdir");

        let zip_path = archive_outputs(&root, "siena_outputs", &["report.siena", REPORT_HTML])
            .expect("archive")
            .expect("archive created");
        assert_eq!(zip_path, root.join("siena_outputs.zip"));
        assert!(!root.join("A_brain.nii.gz").exists());
        assert!(root.join("report.siena").exists());
        assert!(root.join("nested").is_dir());

        let mut archive =
            zip::ZipArchive::new(fs::File::open(&zip_path).expect("open zip")).expect("zip");
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["A_brain.nii.gz", "B_brain.nii.gz"]);
        let mut content = String::new();
        archive
            .by_name("B_brain.nii.gz")
            .expect("entry")
            .read_to_string(&mut content)
            .expect("read entry");
        assert_eq!(content, "B_brain.nii.gz");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn republish_writes_metadata_and_renames_report() {
        let root = temp_root("republish");
        fs::write(root.join("report.sienax"), "GREY 10.5 8.0\nWHITE 20 16\nBRAIN 30.5 24\n")
            .expect("report");
        fs::write(root.join(REPORT_HTML), "<html><body>ok</body></html>").expect("html");
        fs::write(root.join("I_render.png"), [0u8; 4]).expect("png");

        let result = republish(&root, Path::new("/flywheel/v0/input"), ToolMode::Sienax)
            .expect("republish");
        assert!(result.metrics.is_some());
        assert_eq!(result.archive, Some(root.join("sienax_outputs.zip")));
        assert_eq!(
            result.outputs,
            vec![
                root.join(METADATA_FILE),
                root.join(REPORT_HTML),
                root.join("report.sienax.log"),
                root.join("sienax_outputs.zip"),
            ]
        );

        let metadata: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(root.join(METADATA_FILE)).expect("metadata"),
        )
        .expect("json");
        assert_eq!(
            metadata["analysis"]["info"]["WHITE"],
            json!({ "volume": 20.0, "unnormalised-volume": 16.0 })
        );
        let _ = fs::remove_dir_all(root);
    }
}
