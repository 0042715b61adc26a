//! Persistence of apps, development steps and command runs.
//!
//! Layout under the state directory:
//!
//! ```text
//! apps/<app_id>/app.json           app record (atomic rewrite)
//! apps/<app_id>/steps.jsonl        one line per recorded step
//! apps/<app_id>/command_runs.jsonl one line per executed command
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::steps::TaskPlan;
use crate::io::files::write_atomic;

/// What a step record describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A completed prompt/response exchange.
    Development,
    /// Entry into a debug call.
    Debugging,
    /// Start of a task step.
    TaskStep,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Created,
    Planned,
    InProgress,
    Finished,
    Failed,
}

impl AppStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Created => "created",
            AppStatus::Planned => "planned",
            AppStatus::InProgress => "in_progress",
            AppStatus::Finished => "finished",
            AppStatus::Failed => "failed",
        }
    }
}

/// Persistent state of one generated app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub workspace: PathBuf,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub plan: Option<TaskPlan>,
    /// Index of the last successfully completed plan step.
    #[serde(default)]
    pub completed_through: Option<usize>,
}

impl AppRecord {
    pub fn new(name: &str, description: &str, workspace: &Path) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            workspace: workspace.to_path_buf(),
            status: AppStatus::Created,
            created_at: Utc::now(),
            plan: None,
            completed_through: None,
        }
    }

    /// First step index that has not completed yet.
    pub fn resume_index(&self) -> usize {
        self.completed_through.map_or(0, |idx| idx + 1)
    }
}

/// Row for the app listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSummary {
    pub id: String,
    pub name: String,
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub step_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub kind: RecordKind,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRunEntry {
    pub command: String,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Record/restore interface used for resumability.
pub trait ProjectStore {
    fn record_step(&self, app_id: &str, kind: RecordKind, payload: &Value) -> Result<()>;
    fn record_command_run(
        &self,
        app_id: &str,
        command: &str,
        output: Option<&str>,
        exit_code: Option<i32>,
    ) -> Result<()>;
    fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>>;
    fn save_app(&self, app: &AppRecord) -> Result<()>;
    /// All apps, oldest first.
    fn list_apps(&self) -> Result<Vec<AppSummary>>;
}

/// File-backed store rooted at a state directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            root: state_dir.to_path_buf(),
        }
    }

    fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    fn app_dir(&self, app_id: &str) -> Result<PathBuf> {
        if app_id.is_empty()
            || app_id.contains(['/', '\\'])
            || app_id == "."
            || app_id == ".."
        {
            return Err(anyhow!("invalid app id {app_id:?}"));
        }
        Ok(self.apps_dir().join(app_id))
    }

    /// Recorded steps for `app_id`, in order.
    pub fn steps(&self, app_id: &str) -> Result<Vec<StepEntry>> {
        read_jsonl(&self.app_dir(app_id)?.join("steps.jsonl"))
    }

    pub fn command_runs(&self, app_id: &str) -> Result<Vec<CommandRunEntry>> {
        read_jsonl(&self.app_dir(app_id)?.join("command_runs.jsonl"))
    }
}

fn append_jsonl<T: Serialize>(path: &Path, entry: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(entry).context("serialize record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

fn count_lines(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
}

impl ProjectStore for JsonStore {
    fn record_step(&self, app_id: &str, kind: RecordKind, payload: &Value) -> Result<()> {
        let entry = StepEntry {
            kind,
            at: Utc::now(),
            payload: payload.clone(),
        };
        append_jsonl(&self.app_dir(app_id)?.join("steps.jsonl"), &entry)
    }

    fn record_command_run(
        &self,
        app_id: &str,
        command: &str,
        output: Option<&str>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let entry = CommandRunEntry {
            command: command.to_string(),
            output: output.map(str::to_string),
            exit_code,
            at: Utc::now(),
        };
        append_jsonl(&self.app_dir(app_id)?.join("command_runs.jsonl"), &entry)
    }

    fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>> {
        let path = self.app_dir(app_id)?.join("app.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let app = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(app))
    }

    fn save_app(&self, app: &AppRecord) -> Result<()> {
        let path = self.app_dir(&app.id)?.join("app.json");
        let mut buf = serde_json::to_string_pretty(app).context("serialize app")?;
        buf.push('\n');
        write_atomic(&path, &buf)?;
        debug!(app_id = %app.id, status = app.status.as_str(), "saved app");
        Ok(())
    }

    fn list_apps(&self) -> Result<Vec<AppSummary>> {
        let dir = self.apps_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut apps = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.get_app(&id) {
                Ok(Some(app)) => apps.push(AppSummary {
                    step_count: count_lines(&entry.path().join("steps.jsonl"))?,
                    id: app.id,
                    name: app.name,
                    status: app.status,
                    created_at: app.created_at,
                }),
                Ok(None) => debug!(id = %id, "skipping directory without app.json"),
                Err(e) => warn!(id = %id, err = %e, "skipping unreadable app"),
            }
        }
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(apps)
    }
}
