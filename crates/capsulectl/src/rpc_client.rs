//! RPC Client - unix socket client for talking to capsuled.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};
use capsule_common::ipc::{Method, Request, Response, ResponseData};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_SOCKET: &str = "/run/capsuled/capsuled.sock";

pub struct RpcClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl RpcClient {
    /// Socket path resolution: explicit flag, then $CAPSULED_SOCKET,
    /// then the default location.
    pub fn discover_socket_path(explicit_path: Option<&str>) -> String {
        if let Some(path) = explicit_path {
            return path.to_string();
        }
        if let Ok(path) = std::env::var("CAPSULED_SOCKET") {
            return path;
        }
        DEFAULT_SOCKET.to_string()
    }

    pub async fn connect(socket_path: Option<&str>) -> Result<Self> {
        let path = Self::discover_socket_path(socket_path);
        let stream = UnixStream::connect(&path)
            .await
            .with_context(|| format!("cannot connect to capsuled at {path} (is it running?)"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// One request, one response.
    pub async fn request(&mut self, method: Method) -> Result<ResponseData> {
        let request = Request {
            id: REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            method,
        };
        let payload = serde_json::to_string(&request)? + "\n";
        self.writer
            .write_all(payload.as_bytes())
            .await
            .context("failed to send request")?;

        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("failed to read response")?;
        if bytes_read == 0 {
            return Err(anyhow!("daemon closed the connection"));
        }

        let response: Response =
            serde_json::from_str(&line).context("malformed response from daemon")?;
        if response.id != request.id {
            return Err(anyhow!("response id mismatch"));
        }
        response
            .result
            .map_err(|e| anyhow!("{} (code {})", e.message, e.code))
    }
}
