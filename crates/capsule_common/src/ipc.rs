//! IPC protocol between capsuled and its clients.
//!
//! JSON-lines over the daemon's unix socket: one request object per line,
//! one response object per line, matched by `id`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::image::CapsuleImage;
use crate::session::SessionSummary;

/// IPC request from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

/// IPC response from daemon to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, RpcError>,
}

/// Wire form of a daemon error: stable code plus rendered message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Request methods, mapping 1:1 onto daemon core operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum Method {
    /// Health check.
    Ping,

    /// Daemon status.
    Status,

    /// Submit a staged session. Candidate images are picked up from the
    /// per-session staging directories.
    Submit {
        session_id: u64,
        child_session_ids: Vec<u64>,
        /// Set when this session rolls back an earlier failed one.
        #[serde(default)]
        is_rollback: bool,
        #[serde(default)]
        rollback_of: Option<u64>,
    },

    /// Mark a staged session ready for activation on the next boot.
    MarkReady { session_id: u64 },

    /// Accept an activated session as successful.
    MarkSuccessful { session_id: u64 },

    /// Abort a non-terminal session, reverting any partial activation.
    Abort { session_id: u64 },

    /// List all persisted sessions.
    GetSessions,

    /// List the currently active capsules.
    GetActiveCapsules,

    /// Verify and activate a single image file immediately.
    Activate { path: PathBuf },

    /// Deactivate the instance mounted at the given version-qualified
    /// mount point.
    Deactivate { mount_point: PathBuf },

    /// Revert the most recent activated session.
    Rollback,
}

/// Response payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ResponseData {
    /// Simple success/pong.
    Ok,

    /// Daemon status.
    Status(StatusData),

    /// Images resolved by a submit call.
    Submitted(Vec<CapsuleImage>),

    /// All persisted sessions.
    Sessions(Vec<SessionSummary>),

    /// Currently active capsules.
    ActiveCapsules(Vec<ActiveCapsule>),
}

/// One active (canonically mounted) capsule instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveCapsule {
    pub name: String,
    pub version: u64,
    pub backing_file: PathBuf,
    pub mount_point: PathBuf,
}

/// Daemon status information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    pub version: String,
    pub uptime_seconds: u64,
    pub mounted_instances: usize,
    pub active_capsules: usize,
    pub open_sessions: usize,
}
