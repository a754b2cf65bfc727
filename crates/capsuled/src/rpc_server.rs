//! RPC Server - unix socket server for daemon-client communication.
//!
//! JSON-lines protocol: one request per line, one response per line.
//! Every operation takes the core lock for its full duration, which
//! serializes all mount-state and session mutations.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use capsule_common::ipc::{Method, Request, Response, ResponseData, RpcError, StatusData};
use capsule_common::CapsuleError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::state::Core;

/// Daemon state shared across connections.
pub struct DaemonState {
    pub version: String,
    pub start_time: std::time::Instant,
    pub core: Mutex<Core>,
}

impl DaemonState {
    pub fn new(core: Core) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
            core: Mutex::new(core),
        }
    }
}

/// Bind the socket and serve forever.
pub async fn start_server(state: Arc<DaemonState>, socket_path: &Path) -> Result<()> {
    if let Some(socket_dir) = socket_path.parent() {
        tokio::fs::create_dir_all(socket_dir)
            .await
            .context("Failed to create socket directory")?;
    }

    // Remove a stale socket from a previous run.
    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path).context("Failed to bind unix socket")?;

    // Owner and group only; the daemon manages privileged mount state.
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
        .context("Failed to set socket permissions")?;

    info!("RPC server listening on {}", socket_path.display());

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;
        if bytes_read == 0 {
            break;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid request JSON: {}", e);
                continue;
            }
        };

        let response = handle_request(request.id, request.method, &state).await;
        let response_json = serde_json::to_string(&response)? + "\n";
        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
    }

    Ok(())
}

fn wire_error(e: CapsuleError) -> RpcError {
    RpcError {
        code: e.code(),
        message: e.to_string(),
    }
}

async fn handle_request(id: u64, method: Method, state: &DaemonState) -> Response {
    let result = match method {
        Method::Ping => Ok(ResponseData::Ok),

        Method::Status => {
            let core = state.core.lock().await;
            Ok(ResponseData::Status(StatusData {
                version: state.version.clone(),
                uptime_seconds: state.start_time.elapsed().as_secs(),
                mounted_instances: core.db.len(),
                active_capsules: core.db.active_instances().len(),
                open_sessions: core.open_session_count(),
            }))
        }

        Method::Submit {
            session_id,
            child_session_ids,
            is_rollback,
            rollback_of,
        } => {
            let mut core = state.core.lock().await;
            core.submit(session_id, &child_session_ids, is_rollback, rollback_of)
                .map(ResponseData::Submitted)
                .map_err(wire_error)
        }

        Method::MarkReady { session_id } => {
            let mut core = state.core.lock().await;
            core.mark_ready(session_id)
                .map(|()| ResponseData::Ok)
                .map_err(wire_error)
        }

        Method::MarkSuccessful { session_id } => {
            let mut core = state.core.lock().await;
            core.mark_successful(session_id)
                .map(|()| ResponseData::Ok)
                .map_err(wire_error)
        }

        Method::Abort { session_id } => {
            let mut core = state.core.lock().await;
            core.abort(session_id)
                .map(|()| ResponseData::Ok)
                .map_err(wire_error)
        }

        Method::GetSessions => {
            let core = state.core.lock().await;
            Ok(ResponseData::Sessions(core.sessions()))
        }

        Method::GetActiveCapsules => {
            let core = state.core.lock().await;
            Ok(ResponseData::ActiveCapsules(core.active_capsules()))
        }

        Method::Activate { path } => {
            let mut core = state.core.lock().await;
            core.activate_image(&path)
                .map(|image| ResponseData::Submitted(vec![image]))
                .map_err(wire_error)
        }

        Method::Deactivate { mount_point } => {
            let mut core = state.core.lock().await;
            core.deactivate(&mount_point)
                .map(|()| ResponseData::Ok)
                .map_err(wire_error)
        }

        Method::Rollback => {
            let mut core = state.core.lock().await;
            core.rollback()
                .map(|()| ResponseData::Ok)
                .map_err(wire_error)
        }
    };

    Response { id, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::fake::FakeCheckpoint;
    use crate::config::Config;
    use crate::device::fake::FakeBackend;
    use crate::verify::testing::install_test_key;
    use crate::verify::ManifestVerifier;
    use tempfile::TempDir;

    fn test_core(dir: &TempDir) -> Core {
        let config = Config {
            capsule_root: dir.path().join("capsule"),
            state_dir: dir.path().join("state"),
            sessions_dir: dir.path().join("state/sessions"),
            staging_dir: dir.path().join("state/staging"),
            keys_dir: dir.path().join("keys.d"),
            socket_path: dir.path().join("run/capsuled.sock"),
            ..Config::default()
        };
        install_test_key(&config.keys_dir);
        Core::with_parts(
            config.clone(),
            Arc::new(FakeBackend::new()),
            Box::new(ManifestVerifier::new(config.keys_dir.clone())),
            Box::new(FakeCheckpoint::committed()),
        )
    }

    async fn round_trip(stream: &mut UnixStream, request: &Request) -> Response {
        let payload = serde_json::to_string(request).unwrap() + "\n";
        stream.write_all(payload.as_bytes()).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn ping_status_and_error_round_trip() {
        let dir = TempDir::new().unwrap();
        let core = test_core(&dir);
        let socket_path = core.config.socket_path.clone();
        let state = Arc::new(DaemonState::new(core));

        let server = tokio::spawn({
            let state = Arc::clone(&state);
            let socket_path = socket_path.clone();
            async move {
                let _ = start_server(state, &socket_path).await;
            }
        });

        // The server needs a moment to bind.
        let mut stream = loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };

        let pong = round_trip(&mut stream, &Request { id: 1, method: Method::Ping }).await;
        assert_eq!(pong.id, 1);
        assert!(matches!(pong.result, Ok(ResponseData::Ok)));

        let status = round_trip(&mut stream, &Request { id: 2, method: Method::Status }).await;
        match status.result {
            Ok(ResponseData::Status(status)) => {
                assert_eq!(status.mounted_instances, 0);
                assert_eq!(status.open_sessions, 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // An invalid-state error crosses the wire with its code.
        let bad = round_trip(
            &mut stream,
            &Request {
                id: 3,
                method: Method::MarkReady { session_id: 404 },
            },
        )
        .await;
        match bad.result {
            Err(e) => assert_eq!(e.code, -32013),
            other => panic!("unexpected response: {other:?}"),
        }

        server.abort();
    }
}
