use fleet_common::spawn_error::SpawnError;
use std::io;
use thiserror::Error;

/// Local supervisor and device-directory failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("empty command")]
    EmptyCommand,
    #[error("process exited before its pid could be read")]
    NoPid,
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("invalid peer url: {0}")]
    InvalidUrl(String),
    #[error("peer {0} is this device")]
    SelfPeer(String),
    #[error("peer rejected the request: {0}")]
    PeerRejected(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("storage error: {0}")]
    Io(#[from] io::Error),
}

/// Transport-level failure talking to a peer agent.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("peer {peer} unreachable: {source}")]
    Transport {
        peer: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("peer {peer} answered {status}: {message}")]
    Status {
        peer: String,
        status: u16,
        message: String,
    },
    #[error("peer {peer} sent an unexpected payload: {source}")]
    Decode {
        peer: String,
        #[source]
        source: reqwest::Error,
    },
}

impl RemoteError {
    /// HTTP status returned by the peer, when it answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Task-manager level failures, mapped to HTTP status codes by the daemon.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    InvalidSchedule(#[from] ScheduleError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("storage error: {0}")]
    Persistence(#[from] io::Error),
}
