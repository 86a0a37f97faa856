use std::io;

use thiserror::Error;

/// Failure reported by a device-channel command.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` still failing after {attempts} attempts")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        #[source]
        last: Box<DeviceError>,
    },
}

impl DeviceError {
    pub fn command(&self) -> &str {
        match self {
            DeviceError::Spawn { command, .. }
            | DeviceError::Exit { command, .. }
            | DeviceError::RetriesExhausted { command, .. } => command,
        }
    }
}

/// Failure talking to the remote metrics store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to reach metrics store at {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("metrics store {url} returned status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("metrics store {url} returned an unreadable payload: {reason}")]
    Decode { url: String, reason: String },
}

impl StoreError {
    /// Elasticsearch-style `error.type` carried by a non-success reply, if any.
    pub fn error_type(&self) -> Option<String> {
        let StoreError::Status { body, .. } = self else {
            return None;
        };
        let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
        parsed
            .pointer("/error/type")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

/// A payload segment that does not follow `scene_name:<name>|data:<value>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("segment {index} `{segment}` is malformed: {reason}")]
pub struct PayloadError {
    pub index: usize,
    pub segment: String,
    pub reason: &'static str,
}
