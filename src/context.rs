use std::{
    fs,
    io::Read,
    path::{Component, Path},
    process::Command,
};

use tracing::{debug, info, warn};

use crate::error::{FanoutError, Result};

pub const TRUNCATION_MARKER: &str = "\n[Context Truncated: max total size reached]\n";

/// Concatenates bounded excerpts of every tracked file under `repo_root`.
///
/// Per-file problems become one-line placeholders; only a failure to list
/// the repository at all is an error. The result never exceeds
/// `max_total_bytes` and ends with [`TRUNCATION_MARKER`] whenever any content
/// was left out because of that ceiling.
pub fn extract_context(
    repo_root: &Path,
    max_file_bytes: u64,
    max_total_bytes: usize,
) -> Result<String> {
    let files = list_tracked_files(repo_root)?;
    info!(repo = %repo_root.display(), files = files.len(), "gathering repository context");
    let context = build_context(repo_root, &files, max_file_bytes, max_total_bytes);
    info!(bytes = context.len(), "repository context ready");
    Ok(context)
}

pub fn list_tracked_files(repo_root: &Path) -> Result<Vec<String>> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_root)
        .args(["ls-files", "-z"])
        .output()
        .map_err(|e| {
            FanoutError::RepositoryAccess(format!(
                "failed to run `git ls-files` in `{}`: {e}",
                repo_root.display()
            ))
        })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FanoutError::RepositoryAccess(format!(
            "`{}` is not a readable git repository: {}",
            repo_root.display(),
            stderr.trim()
        )));
    }

    let files = String::from_utf8_lossy(&output.stdout)
        .split('\0')
        .filter(|p| !p.is_empty())
        .filter(|p| !is_vcs_metadata(Path::new(p)))
        .map(str::to_string)
        .collect();
    Ok(files)
}

fn is_vcs_metadata(rel: &Path) -> bool {
    rel.components()
        .any(|c| matches!(c, Component::Normal(name) if name == ".git"))
}

pub(crate) fn build_context(
    repo_root: &Path,
    files: &[String],
    max_file_bytes: u64,
    max_total_bytes: usize,
) -> String {
    let name = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| repo_root.display().to_string());
    let header = format!("Repository Structure (tracked files in {name}):\n");

    // Room for the marker is kept back so appending it can never overflow.
    let budget = max_total_bytes.saturating_sub(TRUNCATION_MARKER.len());
    if header.len() > budget {
        let mut marker = TRUNCATION_MARKER.trim().to_string();
        marker.truncate(max_total_bytes);
        return marker;
    }

    let mut out = header;
    let mut truncated = false;
    for rel in files {
        let entry = render_entry(repo_root, rel, max_file_bytes);
        if out.len() + entry.len() <= budget {
            out.push_str(&entry);
            continue;
        }
        truncated = true;
        let name_only = format!("- {rel} (skipped: exceeds total context size)\n");
        if out.len() + name_only.len() <= budget {
            out.push_str(&name_only);
            continue;
        }
        warn!("context size ceiling reached, remaining files dropped");
        break;
    }

    if truncated {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

fn render_entry(repo_root: &Path, rel: &str, max_file_bytes: u64) -> String {
    let path = repo_root.join(rel);
    let meta = match fs::metadata(&path) {
        Ok(m) => m,
        Err(e) => {
            debug!(file = rel, error = %e, "tracked file unreadable");
            return format!("- {rel} (skipped: {})\n", short_io_reason(&e));
        }
    };
    if !meta.is_file() {
        return format!("- {rel} (skipped: not a regular file)\n");
    }
    if meta.len() > max_file_bytes {
        return format!(
            "- {rel} (skipped: larger than {} KB)\n",
            max_file_bytes / 1024
        );
    }
    if meta.len() == 0 {
        return format!("- {rel} (empty file)\n");
    }

    match read_text(&path, max_file_bytes) {
        Ok(Some(text)) => format!("\n--- File: {rel} ---\n{text}\n--- End File ---\n"),
        Ok(None) => format!("- {rel} (skipped: binary file)\n"),
        Err(e) => format!("- {rel} (skipped: read error: {})\n", short_io_reason(&e)),
    }
}

fn short_io_reason(e: &std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::NotFound => "not found".to_string(),
        std::io::ErrorKind::PermissionDenied => "permission denied".to_string(),
        _ => e.to_string(),
    }
}

/// Reads at most `limit` bytes; `Ok(None)` means the file looks binary.
fn read_text(path: &Path, limit: u64) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    fs::File::open(path)?.take(limit).read_to_end(&mut buf)?;
    if buf.contains(&0u8) {
        return Ok(None);
    }
    let Ok(s) = String::from_utf8(buf) else {
        return Ok(None);
    };
    let s = s.trim_start_matches('\u{FEFF}');
    Ok(Some(s.replace("\r\n", "\n")))
}
