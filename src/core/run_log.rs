//! Append-only run log with file-based persistence.
//!
//! Each run gets `<base>/<run_id>/` holding `events.jsonl` (one JSON event
//! per line, appended as the run progresses) and `report.json` (the final
//! [`PipelineRunReport`], written once the run ends).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Event, PipelineRunReport};

const EVENTS_FILE: &str = "events.jsonl";
const REPORT_FILE: &str = "report.json";

/// Event log and report storage for one run
#[derive(Debug, Clone)]
pub struct RunLog {
    run_dir: PathBuf,
    events_path: PathBuf,
}

impl RunLog {
    /// Create or open the log for a run under `base_dir`
    pub async fn open(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join(EVENTS_FILE);

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one event as a single JSON line
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open run log: {}", self.events_path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("Failed to append to run log: {}", self.events_path.display()))?;
        file.flush().await.context("Failed to flush run log")?;

        Ok(())
    }

    /// Read all events back in the order they were written.
    ///
    /// A process killed mid-append can leave a torn final line; it is
    /// dropped with a warning. Corruption anywhere else is an error.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let content = match fs::read_to_string(&self.events_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read run log: {}", self.events_path.display())
                })
            }
        };

        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();

        let mut events = Vec::with_capacity(lines.len());
        for (position, (number, line)) in lines.iter().enumerate() {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(e) if position + 1 == lines.len() => {
                    warn!(
                        path = %self.events_path.display(),
                        line = number + 1,
                        error = %e,
                        "Dropping torn final run log entry"
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "Corrupt run log entry at {}:{}",
                            self.events_path.display(),
                            number + 1
                        )
                    })
                }
            }
        }

        Ok(events)
    }

    /// Write the final report next to the events
    pub async fn write_report(&self, report: &PipelineRunReport) -> Result<PathBuf> {
        let path = self.run_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;

        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write report: {}", path.display()))?;

        Ok(path)
    }

    /// Load a stored report, rebuilding it from events if the run never finished
    pub async fn load_report(base_dir: &Path, run_id: Uuid) -> Result<Option<PipelineRunReport>> {
        let run_dir = base_dir.join(run_id.to_string());
        if !run_dir.is_dir() {
            return Ok(None);
        }

        let report_path = run_dir.join(REPORT_FILE);
        if report_path.exists() {
            let content = fs::read_to_string(&report_path)
                .await
                .with_context(|| format!("Failed to read report: {}", report_path.display()))?;
            let report = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse report: {}", report_path.display()))?;
            return Ok(Some(report));
        }

        let log = Self {
            events_path: run_dir.join(EVENTS_FILE),
            run_dir,
        };
        let events = log.replay().await?;
        Ok(PipelineRunReport::from_events(&events))
    }

    /// Run IDs with a directory under `base_dir`, sorted
    pub async fn list_runs(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read log directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(run_id) = name.to_str().and_then(|n| Uuid::parse_str(n).ok()) {
                runs.push(run_id);
            }
        }

        runs.sort();
        Ok(runs)
    }
}
