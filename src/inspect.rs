//! Read-only views over persisted runs, plus the plan overview shown before
//! launch.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    process::Command,
};

use crossterm::style::Stylize;
use ignore::WalkBuilder;
use tracing::warn;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::{
    error::{FanoutError, Result},
    session::{EXIT_MARKER, ProcessLauncher},
    store::RunSummary,
    types::{Run, RunStatus, Task},
};

const CHANGE_COLUMNS: usize = 60;
const ACTIVITY_PROBE_BYTES: u64 = 4096;
const EXCERPT_LINES: usize = 10;
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

// ── runs list ─────────────────────────────────────────────────────────────────

pub fn render_run_table(runs: &[RunSummary], color: bool) -> String {
    if runs.is_empty() {
        return "No runs recorded yet.\n".to_string();
    }
    let id_w = runs
        .iter()
        .map(|r| r.run_id.width())
        .max()
        .unwrap_or(0)
        .max("ID".len());
    let status_w = runs
        .iter()
        .map(|r| r.status.as_str().len())
        .max()
        .unwrap_or(0)
        .max("STATUS".len());

    let mut out = String::new();
    let header = format!("{:id_w$}  {:status_w$}  CHANGE", "ID", "STATUS");
    out.push_str(&if color { header.bold().to_string() } else { header });
    out.push('\n');
    for run in runs {
        let status = format!("{:status_w$}", run.status.as_str());
        let status = if color {
            paint_status(run.status, status)
        } else {
            status
        };
        out.push_str(&format!(
            "{:id_w$}  {status}  {}\n",
            run.run_id,
            truncate_columns(&run.request_snippet, CHANGE_COLUMNS)
        ));
    }
    out
}

fn paint_status(status: RunStatus, text: String) -> String {
    match status {
        RunStatus::Launched => text.cyan().to_string(),
        RunStatus::Summarized => text.green().to_string(),
        RunStatus::Failed | RunStatus::LaunchFailed => text.red().to_string(),
        RunStatus::Started | RunStatus::PlanGenerated => text.yellow().to_string(),
    }
}

/// Cuts `s` to at most `max` terminal columns, ending in an ellipsis when cut.
pub fn truncate_columns(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in s.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > max.saturating_sub(1) {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}

// ── runs show ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskActivity {
    NoLog,
    Running,
    Exited(i32),
}

impl TaskActivity {
    pub fn label(self) -> String {
        match self {
            Self::NoLog => "no log".to_string(),
            Self::Running => "running".to_string(),
            Self::Exited(code) => format!("exited (status {code})"),
        }
    }
}

/// Looks for the exit marker near the end of a task log.
pub fn task_activity(log_path: &Path) -> TaskActivity {
    let Ok(mut file) = File::open(log_path) else {
        return TaskActivity::NoLog;
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > ACTIVITY_PROBE_BYTES && file.seek(SeekFrom::Start(len - ACTIVITY_PROBE_BYTES)).is_err()
    {
        return TaskActivity::Running;
    }
    let mut raw = Vec::new();
    if file.take(ACTIVITY_PROBE_BYTES).read_to_end(&mut raw).is_err() {
        return TaskActivity::Running;
    }
    String::from_utf8_lossy(&raw)
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(EXIT_MARKER))
        .and_then(|code| code.trim().parse().ok())
        .map_or(TaskActivity::Running, TaskActivity::Exited)
}

pub fn render_run_detail(run: &Run) -> String {
    let mut out = String::new();
    let mut field = |name: &str, value: &str| out.push_str(&format!("{name:<14}{value}\n"));
    field("Run:", &run.run_id);
    field("Status:", run.status.as_str());
    field("Created:", &run.created_at.to_rfc3339());
    field("Updated:", &run.updated_at.to_rfc3339());
    field("Repository:", &run.repo_root.display().to_string());
    if let Some(config) = &run.config_path {
        field("Config:", &config.display().to_string());
    }
    field(
        "Session:",
        run.session_handle.as_deref().unwrap_or("(not launched)"),
    );
    if let Some(path) = &run.requirements_path {
        field("Requirements:", path);
    }
    if let Some(error) = &run.error {
        field("Error:", error);
    }

    out.push_str("\nChange request:\n");
    for line in run.request_text.lines() {
        out.push_str(&format!("  {line}\n"));
    }

    if run.tasks.is_empty() {
        out.push_str("\nNo tasks.\n");
        return out;
    }
    for task in &run.tasks {
        out.push('\n');
        out.push_str(&render_task(task));
    }
    out
}

fn render_task(task: &Task) -> String {
    let mut out = format!("Task {}\n", task.task_id);
    out.push_str(&format!("  Description: {}\n", task.description));
    out.push_str("  Files:\n");
    for file in &task.target_files {
        out.push_str(&format!("    - {file}\n"));
    }
    let exists = if task.log_path.is_file() { "" } else { " (missing)" };
    out.push_str(&format!("  Log: {}{exists}\n", task.log_path.display()));
    out.push_str(&format!("  Activity: {}\n", task_activity(&task.log_path).label()));
    if let Some(summary) = &task.summary {
        out.push_str(&format!(
            "  Summary: {} / grade {}\n",
            summary.status_label.as_str(),
            summary.grade.as_str()
        ));
        for line in summary.narrative.lines() {
            out.push_str(&format!("    {line}\n"));
        }
    }
    out
}

/// Per-task summary block printed by `runs summarize`.
pub fn render_summaries(run: &Run) -> String {
    let mut out = String::new();
    for task in &run.tasks {
        let rule = "-".repeat(30);
        out.push_str(&format!("{rule}\nTask {} summary\n{rule}\n", task.task_id));
        match &task.summary {
            Some(s) => {
                out.push_str(&format!(
                    "Status: {}\nGrade: {}\n{}\n",
                    s.status_label.as_str(),
                    s.grade.as_str(),
                    s.narrative
                ));
            }
            None => out.push_str("(not summarized)\n"),
        }
    }
    out
}

// ── runs log / runs attach ────────────────────────────────────────────────────

pub fn resolve_task<'a>(run: &'a Run, task_id: usize) -> Result<&'a Task> {
    run.task(task_id).ok_or_else(|| {
        FanoutError::NotFound(format!("task {task_id} in run `{}`", run.run_id))
    })
}

/// Last `n` lines of a file, decoded lossily. Reads backwards from the end in
/// growing windows instead of loading the whole log.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<String> {
    let mut file = File::open(path)?;
    if n == 0 {
        return Ok(String::new());
    }
    let len = file.metadata()?.len();
    let mut window = TAIL_WINDOW_BYTES.min(len);
    loop {
        file.seek(SeekFrom::Start(len - window))?;
        let mut raw = Vec::with_capacity(window as usize);
        std::io::Read::by_ref(&mut file).take(window).read_to_end(&mut raw)?;
        let whole_file = window == len;
        // n + 1 newlines guarantee n complete lines after the cut
        if whole_file || raw.iter().filter(|&&b| b == b'\n').count() > n {
            let text = String::from_utf8_lossy(&raw);
            let lines: Vec<&str> = text.lines().skip(usize::from(!whole_file)).collect();
            let start = lines.len().saturating_sub(n);
            let mut out = lines[start..].join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            return Ok(out);
        }
        window = window.saturating_mul(2).min(len);
    }
}

/// Opens the log in `pager` when one is given, otherwise (or when the pager
/// cannot be started) copies it to stdout.
pub fn show_log(path: &Path, pager: Option<&str>) -> Result<()> {
    if !path.is_file() {
        return Err(FanoutError::NotFound(format!("log file {}", path.display())));
    }
    if let Some(pager) = pager {
        let mut words = pager.split_whitespace();
        if let Some(program) = words.next() {
            match Command::new(program).args(words).arg(path).status() {
                Ok(_) => return Ok(()),
                Err(e) => warn!(pager = program, error = %e, "pager unavailable; printing log"),
            }
        }
    }
    let mut file = File::open(path)?;
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    io::copy(&mut file, &mut lock)?;
    lock.flush()?;
    Ok(())
}

pub fn attach_hint(run: &Run, launcher: &dyn ProcessLauncher) -> Result<String> {
    let session = run.session_handle.as_deref().ok_or_else(|| {
        FanoutError::NotFound(format!(
            "tmux session for run `{}` (status {})",
            run.run_id, run.status
        ))
    })?;
    Ok(launcher.attach_command(session).join(" "))
}

// ── plan overview ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub files: usize,
    pub bytes: u64,
}

/// Files matched by one `target_files` entry: a glob, a directory (walked
/// honouring ignore files), or a single path that may not exist yet.
pub fn target_stats(repo_root: &Path, entry: &str) -> FileStats {
    let mut stats = FileStats::default();
    let mut add = |path: &Path| {
        if let Ok(meta) = fs::metadata(path) {
            if meta.is_file() {
                stats.files += 1;
                stats.bytes += meta.len();
            }
        }
    };

    let full = repo_root.join(entry);
    if entry.contains(['*', '?', '[']) {
        let pattern = full.to_string_lossy();
        match glob::glob(&pattern) {
            Ok(paths) => paths.flatten().for_each(|p| add(&p)),
            Err(e) => warn!(pattern = entry, error = %e, "invalid glob in target files"),
        }
    } else if full.is_dir() {
        for dir_entry in WalkBuilder::new(&full).build().flatten() {
            add(dir_entry.path());
        }
    } else {
        add(&full);
    }
    stats
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn render_plan_overview(repo_root: &Path, requirements_doc: &str, tasks: &[Task]) -> String {
    let mut out = String::from("Requirements (excerpt):\n");
    let excerpt: Vec<&str> = requirements_doc
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    for line in excerpt.iter().take(EXCERPT_LINES) {
        out.push_str(&format!("  {line}\n"));
    }
    if excerpt.len() > EXCERPT_LINES {
        out.push_str("  ...\n");
    }

    out.push_str(&format!("\nPlanned tasks ({}):\n", tasks.len()));
    for task in tasks {
        let total = task
            .target_files
            .iter()
            .map(|entry| target_stats(repo_root, entry))
            .fold(FileStats::default(), |acc, s| FileStats {
                files: acc.files + s.files,
                bytes: acc.bytes + s.bytes,
            });
        out.push_str(&format!(
            "  [{}] {}\n      {} entries, {} existing files, {}\n",
            task.task_id,
            truncate_columns(task.description.lines().next().unwrap_or_default(), 72),
            task.target_files.len(),
            total.files,
            human_size(total.bytes)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        testing::RecordingLauncher,
        types::{Grade, StatusLabel, TaskSummary},
    };

    fn summary(id: &str, status: RunStatus, text: &str) -> RunSummary {
        RunSummary {
            run_id: id.to_string(),
            status,
            request_snippet: text.to_string(),
        }
    }

    #[test]
    fn table_lists_runs_in_given_order() {
        let table = render_run_table(
            &[
                summary("20240102_000000_000", RunStatus::Launched, "Add logging"),
                summary("20240101_000000_000", RunStatus::LaunchFailed, "Fix bug"),
            ],
            false,
        );
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("ID"));
        assert!(lines[0].contains("STATUS"));
        assert!(lines[1].starts_with("20240102_000000_000  launched"));
        assert!(lines[2].contains("launch_failed  Fix bug"));
        assert_eq!(render_run_table(&[], false), "No runs recorded yet.\n");
    }

    #[test]
    fn truncation_counts_display_columns() {
        assert_eq!(truncate_columns("short", 10), "short");
        let cut = truncate_columns("日本語のテキストです", 7);
        assert!(cut.width() <= 7);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn activity_reads_exit_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("task_0.log");
        assert_eq!(task_activity(&log), TaskActivity::NoLog);

        fs::write(&log, "working...\n").unwrap();
        assert_eq!(task_activity(&log), TaskActivity::Running);

        fs::write(&log, format!("{}\n{EXIT_MARKER} 2\n", "x".repeat(10_000))).unwrap();
        assert_eq!(task_activity(&log), TaskActivity::Exited(2));
        assert_eq!(TaskActivity::Exited(2).label(), "exited (status 2)");
    }

    #[test]
    fn detail_shows_tasks_summaries_and_error() {
        let mut run = Run::new("r1", "Add logging", Path::new("/repo"));
        run.error = Some("tmux exploded".to_string());
        run.tasks.push(Task {
            task_id: 0,
            description: "logger".to_string(),
            target_files: vec!["src/log.rs".to_string()],
            log_path: PathBuf::from("/definitely/missing/task_0.log"),
            summary: Some(TaskSummary {
                status_label: StatusLabel::Completed,
                grade: Grade::B,
                narrative: "added logger".to_string(),
            }),
        });
        let text = render_run_detail(&run);
        assert!(text.contains("Status:       started"));
        assert!(text.contains("Error:        tmux exploded"));
        assert!(text.contains("    - src/log.rs"));
        assert!(text.contains("task_0.log (missing)"));
        assert!(text.contains("Activity: no log"));
        assert!(text.contains("Summary: completed / grade B"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("l.log");
        fs::write(&log, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_lines(&log, 2).unwrap(), "c\nd\n");
        assert_eq!(tail_lines(&log, 10).unwrap(), "a\nb\nc\nd\n");
        assert_eq!(tail_lines(&log, 0).unwrap(), "");
    }

    #[test]
    fn tail_tolerates_invalid_utf8() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("l.log");
        fs::write(&log, b"Applied edit\n\xff\xfe progress bar\nDone\n").unwrap();
        assert_eq!(tail_lines(&log, 1).unwrap(), "Done\n");
        assert_eq!(
            tail_lines(&log, 2).unwrap(),
            "\u{FFFD}\u{FFFD} progress bar\nDone\n"
        );
    }

    #[test]
    fn tail_of_large_log_reads_past_first_window() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("l.log");
        let body: String = (0..20_000).map(|i| format!("line {i}\n")).collect();
        assert!(body.len() as u64 > TAIL_WINDOW_BYTES);
        fs::write(&log, &body).unwrap();
        assert_eq!(
            tail_lines(&log, 3).unwrap(),
            "line 19997\nline 19998\nline 19999\n"
        );
        let many = tail_lines(&log, 15_000).unwrap();
        assert_eq!(many.lines().count(), 15_000);
        assert!(many.starts_with("line 5000\n"));
    }

    #[test]
    fn attach_requires_launched_session() {
        let launcher = RecordingLauncher::default();
        let mut run = Run::new("r1", "x", Path::new("/repo"));
        assert!(matches!(
            attach_hint(&run, &launcher),
            Err(FanoutError::NotFound(_))
        ));
        run.session_handle = Some("fanout_r1".to_string());
        assert_eq!(attach_hint(&run, &launcher).unwrap(), "true fanout_r1");
    }

    #[test]
    fn stats_cover_globs_dirs_and_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("src/nested")).unwrap();
        fs::write(tmp.path().join("src/a.rs"), "12345").unwrap();
        fs::write(tmp.path().join("src/nested/b.rs"), "123").unwrap();
        fs::write(tmp.path().join("README.md"), "1").unwrap();

        assert_eq!(
            target_stats(tmp.path(), "src/*.rs"),
            FileStats { files: 1, bytes: 5 }
        );
        assert_eq!(
            target_stats(tmp.path(), "src/"),
            FileStats { files: 2, bytes: 8 }
        );
        assert_eq!(
            target_stats(tmp.path(), "README.md"),
            FileStats { files: 1, bytes: 1 }
        );
        assert_eq!(target_stats(tmp.path(), "new.rs"), FileStats::default());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn overview_excerpts_requirements() {
        let doc: String = (0..15).map(|i| format!("line {i}\n\n")).collect();
        let tasks = vec![Task {
            task_id: 0,
            description: "logger".to_string(),
            target_files: vec!["missing.rs".to_string()],
            log_path: PathBuf::from("/l/task_0.log"),
            summary: None,
        }];
        let text = render_plan_overview(Path::new("/nonexistent"), &doc, &tasks);
        assert!(text.contains("  line 9\n"));
        assert!(!text.contains("line 10"));
        assert!(text.contains("Planned tasks (1):"));
        assert!(text.contains("[0] logger"));
        assert!(text.contains("1 entries, 0 existing files, 0 B"));
    }
}
