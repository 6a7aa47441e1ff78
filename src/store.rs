use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    error::{FanoutError, Result},
    types::{Run, RunStatus},
};

const SNIPPET_CHARS: usize = 60;

/// One JSON document per run under `state_dir`.
pub struct RunStore {
    dir: PathBuf,
}

/// What `runs list` shows for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub request_snippet: String,
}

/// Only the fields a listing needs; the rest of each file is skipped.
#[derive(Deserialize)]
struct RunHeader {
    run_id: String,
    status: RunStatus,
    request_text: String,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("run_{run_id}.json"))
    }

    /// Writes to a sibling temp file and renames it over the record, so a
    /// crash mid-write never leaves a truncated record behind.
    pub fn save(&self, run: &Run) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| store_err(&self.dir, e))?;
        let path = self.path_for(&run.run_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(run)
            .map_err(|e| FanoutError::Store(format!("cannot encode run {}: {e}", run.run_id)))?;

        let mut file = fs::File::create(&tmp).map_err(|e| store_err(&tmp, e))?;
        file.write_all(&body).map_err(|e| store_err(&tmp, e))?;
        file.sync_all().map_err(|e| store_err(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| store_err(&path, e))?;
        debug!(run_id = %run.run_id, status = %run.status, "run saved");
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Run> {
        let path = self.path_for(run_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FanoutError::NotFound(format!("run `{run_id}`")));
            }
            Err(e) => return Err(store_err(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map_err(|e| FanoutError::Store(format!("{} is corrupt: {e}", path.display())))
    }

    /// Newest first. Unreadable records are skipped with a warning.
    pub fn list_all(&self) -> Result<Vec<RunSummary>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(store_err(&self.dir, e)),
        };

        let mut runs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run_") && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            let header = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|raw| {
                    serde_json::from_slice::<RunHeader>(&raw).map_err(|e| e.to_string())
                });
            match header {
                Ok(h) => runs.push(RunSummary {
                    request_snippet: snippet(&h.request_text),
                    run_id: h.run_id,
                    status: h.status,
                }),
                Err(error) => warn!(path = %path.display(), %error, "skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(runs)
    }
}

fn snippet(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= SNIPPET_CHARS {
        return line;
    }
    let mut out: String = line.chars().take(SNIPPET_CHARS - 3).collect();
    out.push_str("...");
    out
}

fn store_err(path: &Path, e: std::io::Error) -> FanoutError {
    FanoutError::Store(format!("{}: {e}", path.display()))
}
