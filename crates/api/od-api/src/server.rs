//! Connection handling: loopback TCP 1453 + Unix socket, one frame each.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use od_common::progress::{ProgressSink, ProgressUpdate};

use crate::auth::{AuthLevel, AuthState, capability_allows};
use crate::dispatch::ActionTable;
use crate::frames::{ApiRequest, ApiResponse, ProgressFrame};
use crate::API_TCP_PORT;

const MAX_FRAME: usize = 1 << 20;
const BIND_RETRY: Duration = Duration::from_secs(1);

pub struct ApiServer {
    auth: Arc<AuthState>,
    actions: Arc<ActionTable>,
}

impl ApiServer {
    pub fn new(auth: Arc<AuthState>, actions: ActionTable) -> Arc<Self> {
        Arc::new(Self { auth, actions: Arc::new(actions) })
    }

    pub fn auth(&self) -> &Arc<AuthState> {
        &self.auth
    }

    /// TCP listener for the CLI. An address-in-use bind error retries every
    /// second: during a self-restart the old instance may still hold the
    /// port for a moment.
    pub async fn run_tcp(self: Arc<Self>) {
        let addr = SocketAddr::from(([127, 0, 0, 1], API_TCP_PORT));
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("API port busy, retrying in 1s");
                    tokio::time::sleep(BIND_RETRY).await;
                }
                Err(e) => {
                    warn!("API TCP bind failed: {e}");
                    tokio::time::sleep(BIND_RETRY).await;
                }
            }
        };
        info!(%addr, "Control API listening (tcp)");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if !self.auth.peer_permitted(peer.ip()).await {
                        debug!(peer = %peer, "Rejected non-loopback API connection");
                        continue;
                    }
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_conn(stream, Some(peer.ip())).await;
                    });
                }
                Err(e) => {
                    warn!("API accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Unix socket for sandboxed containers; mode 0666 so any uid inside
    /// a container with the mount can connect (auth still applies).
    pub async fn run_unix(self: Arc<Self>, path: &Path) -> Result<()> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("bind {}", path.display()))?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        }
        info!(path = %path.display(), "Control API listening (unix)");

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_conn(stream, None).await;
                    });
                }
                Err(e) => {
                    warn!("API unix accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// One JSON frame in, progress frames + one response out, then close.
    pub async fn handle_conn<S>(&self, mut stream: S, peer: Option<IpAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let id = Uuid::new_v4().to_string();
        let response = match self.read_request(&mut stream).await {
            Some(request) => self.dispatch(&id, request, peer, &mut stream).await,
            None => ApiResponse::fail(&id, "invalid_json"),
        };

        if let Ok(json) = serde_json::to_string(&response) {
            let _ = stream.write_all(json.as_bytes()).await;
        }
        let _ = stream.shutdown().await;
    }

    /// Accumulate bytes until they parse as a request frame.
    async fn read_request<S>(&self, stream: &mut S) -> Option<ApiRequest>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = Vec::with_capacity(512);
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => return serde_json::from_slice(&buf).ok(),
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Ok(request) = serde_json::from_slice::<ApiRequest>(&buf) {
                        return Some(request);
                    }
                    if buf.len() > MAX_FRAME {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
    }

    async fn dispatch<S>(
        &self,
        id: &str,
        request: ApiRequest,
        peer: Option<IpAddr>,
        stream: &mut S,
    ) -> ApiResponse
    where
        S: AsyncWrite + Unpin,
    {
        let level = self.auth.classify(&request.auth).await;
        match &level {
            AuthLevel::Denied => {
                debug!(action = request.action, ?peer, "Unauthorized request");
                return ApiResponse::fail(id, "unauthorized");
            }
            AuthLevel::Capability(identity) => {
                if !capability_allows(&request.action) {
                    debug!(
                        action = request.action,
                        identity, "Capability token denied action"
                    );
                    return ApiResponse::fail(id, "permission_denied");
                }
            }
            AuthLevel::Root => {}
        }

        let Some(handler) = self.actions.get(&request.action) else {
            return ApiResponse::fail(id, "unknown_action");
        };

        // Progress updates flow through a channel so the handler never
        // borrows the connection.
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();
        let sink: ProgressSink = Arc::new(move |update| {
            let _ = tx.send(update);
        });

        let mut fut = handler(request.data, Some(sink));
        let result = loop {
            tokio::select! {
                update = rx.recv() => {
                    if let Some(update) = update {
                        self.write_progress(stream, id, update).await;
                    }
                }
                result = &mut fut => break result,
            }
        };
        // Drain updates emitted right before completion.
        while let Ok(update) = rx.try_recv() {
            self.write_progress(stream, id, update).await;
        }

        match result {
            Ok(message) => ApiResponse::ok(id, message),
            Err(message) => ApiResponse::fail(id, message),
        }
    }

    async fn write_progress<S>(&self, stream: &mut S, id: &str, update: ProgressUpdate)
    where
        S: AsyncWrite + Unpin,
    {
        let frame = ProgressFrame { id: id.to_string(), update };
        if let Ok(mut json) = serde_json::to_string(&frame) {
            json.push_str("\r\n");
            let _ = stream.write_all(json.as_bytes()).await;
        }
    }
}
