use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::orchestrator::AttemptState;

/// Receives every attempt state transition.
pub trait TransitionSink {
    fn record(&self, event: &AttemptEvent);
}

/// Append-only JSON-L log of attempt transitions.
#[derive(Debug, Clone)]
pub struct EventLog {
    log_path: PathBuf,
}

impl EventLog {
    pub fn new(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }

    /// Append a new event to the JSON-L log.
    pub fn append_event(&self, event: &AttemptEvent) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Unable to create event log directory {}", parent.display())
            })?;
        }

        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open event log {}", self.log_path.display()))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read the most recent `limit` events from the JSON-L log.
    pub fn read_events(&self, limit: usize) -> Result<Vec<AttemptEvent>> {
        if limit == 0 || !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.log_path)
            .with_context(|| format!("Failed to open event log {}", self.log_path.display()))?;
        let reader = BufReader::new(file);

        let mut buffer: VecDeque<AttemptEvent> = VecDeque::with_capacity(limit);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AttemptEvent = serde_json::from_str(&line)
                .with_context(|| format!("Malformed event in {}", self.log_path.display()))?;
            if buffer.len() == limit {
                buffer.pop_front();
            }
            buffer.push_back(event);
        }

        Ok(buffer.into_iter().collect())
    }
}

impl TransitionSink for EventLog {
    fn record(&self, event: &AttemptEvent) {
        if let Err(err) = self.append_event(event) {
            warn!(error = %err, path = %self.log_path.display(), "failed to append attempt event");
        }
    }
}

/// One attempt state transition.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AttemptEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub build: String,
    pub cycle: u32,
    pub retry: u32,
    pub state: AttemptState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AttemptEvent {
    pub fn new(run_id: Uuid, build: &str, cycle: u32, retry: u32, state: AttemptState) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            build: build.to_string(),
            cycle,
            retry,
            state,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
