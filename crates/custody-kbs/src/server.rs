//! Unix socket daemon
//!
//! Connection lifecycle: `Listening -> Accepted -> Authenticating -> Ready -> Closed`.
//! Each connection runs on its own task and handles one request at a time.

use std::future::Future;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use zeroize::Zeroizing;

use crate::broker::{Broker, ConnectionContext};
use crate::client::{BrokerClient, ClientOptions};
use crate::config::ServerConfig;
use crate::error::{BrokerError, Result};
use crate::permission::CallerIdentity;
use crate::protocol::{decode, encode, read_frame, write_frame, ErrorKind, Request, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    Accepted,
    Authenticating,
    Ready,
    Closed,
}

/// Pause after a failed `accept` (e.g. EMFILE) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn transition(id: u64, from: ConnectionState, to: ConnectionState) -> ConnectionState {
    debug!("conn#{} {:?} -> {:?}", id, from, to);
    to
}

/// Serve requests on `stream` until the peer closes it or a transport error
/// occurs. Request-level failures are answered and the loop continues.
pub async fn serve_connection<S>(
    broker: Arc<Broker>,
    mut stream: S,
    mut ctx: ConnectionContext,
    max_frame_bytes: usize,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match read_frame(&mut stream, max_frame_bytes).await? {
            Some(frame) => Zeroizing::new(frame),
            None => return Ok(()),
        };

        let response = match decode::<Request>(&frame) {
            Ok(request) => broker.handle(&mut ctx, request).await,
            Err(err) => {
                warn!("conn#{} undecodable request: {}", ctx.id(), err);
                Response::from_error(&err)
            }
        };

        let mut body = Zeroizing::new(encode(&response)?);
        if body.len() > max_frame_bytes {
            let oversized = Response::error(
                ErrorKind::Malformed,
                format!("response of {} bytes exceeds the frame limit", body.len()),
            );
            body = Zeroizing::new(encode(&oversized)?);
        }
        write_frame(&mut stream, &body, max_frame_bytes).await?;
    }
}

/// Listening broker daemon
pub struct BrokerServer {
    listener: UnixListener,
    socket_path: PathBuf,
    broker: Arc<Broker>,
    max_frame_bytes: usize,
    next_id: AtomicU64,
}

impl BrokerServer {
    /// Bind the configured socket. Fails if a live broker already answers on
    /// it; a stale socket file is replaced.
    pub async fn bind(config: &ServerConfig, broker: Arc<Broker>) -> Result<Self> {
        let path = config.socket_path.clone();

        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if !meta.file_type().is_socket() {
                return Err(BrokerError::Config(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            let probe = ClientOptions {
                ping_timeout: config.probe_timeout(),
                connect_attempts: 1,
                ..ClientOptions::default()
            };
            if BrokerClient::connect(&path, probe).await.is_ok() {
                return Err(BrokerError::Config(format!(
                    "another broker is already serving {}",
                    path.display()
                )));
            }
            info!("Removing stale socket {}", path.display());
            std::fs::remove_file(&path)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(config.socket_mode))?;
        info!("Broker listening on {} (mode {:o})", path.display(), config.socket_mode);

        Ok(Self {
            listener,
            socket_path: path,
            broker,
            max_frame_bytes: config.max_frame_bytes,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until ctrl-c
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Accept connections until `shutdown` completes, then remove the socket
    /// file. Connections already running finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        debug!("{:?}", ConnectionState::Listening);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down broker on {}", self.socket_path.display());
                    break;
                }
                accepted = self.listener.accept() => {
                    if let Some((stream, _)) = accepted_or_backoff(accepted).await {
                        self.spawn_connection(stream);
                    }
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!("Could not remove {}: {}", self.socket_path.display(), e);
        }
        Ok(())
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let broker = Arc::clone(&self.broker);
        let max_frame_bytes = self.max_frame_bytes;

        tokio::spawn(async move {
            let state = transition(id, ConnectionState::Listening, ConnectionState::Accepted);
            let state = transition(id, state, ConnectionState::Authenticating);
            let caller = peer_identity(&stream);
            match caller {
                Some(caller) => info!("conn#{} accepted from {}", id, caller),
                None => warn!("conn#{} peer credentials unavailable, only ping is served", id),
            }
            let state = transition(id, state, ConnectionState::Ready);

            let ctx = ConnectionContext::new(id, caller);
            if let Err(e) = serve_connection(broker, stream, ctx, max_frame_bytes).await {
                warn!("conn#{} closed on transport error: {}", id, e);
            }
            transition(id, state, ConnectionState::Closed);
        });
    }
}

async fn accepted_or_backoff<T>(accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("accept failed: {}", e);
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

fn peer_identity(stream: &UnixStream) -> Option<CallerIdentity> {
    match stream.peer_cred() {
        Ok(cred) => Some(CallerIdentity {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        }),
        Err(e) => {
            debug!("peer_cred failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;
    use crate::permission::PolicyGate;
    use crate::protocol::{constants::DEFAULT_MAX_FRAME_BYTES, ResponseBody};
    use custody_crypto::AlgorithmRegistry;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(PolicyGate::default()),
            AlgorithmRegistry::new(),
        ))
    }

    #[tokio::test]
    async fn test_accept_error_backs_off() {
        let started = std::time::Instant::now();
        let failed: std::io::Result<()> = Err(std::io::Error::from_raw_os_error(24));
        assert!(accepted_or_backoff(failed).await.is_none());
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let started = std::time::Instant::now();
        assert_eq!(accepted_or_backoff(Ok(7u8)).await, Some(7));
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (client, server) = tokio::io::duplex(4096);
        let ctx = ConnectionContext::new(1, None);
        let task = tokio::spawn(serve_connection(broker(), server, ctx, DEFAULT_MAX_FRAME_BYTES));

        let mut client = client;
        write_frame(&mut client, &[0xde, 0xad, 0xbe, 0xef, 0xff], DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        let frame = read_frame(&mut client, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let response: Response = decode(&frame).unwrap();
        assert_eq!(response.error_kind, Some(ErrorKind::Malformed));

        let ping = encode(&Request::ping()).unwrap();
        write_frame(&mut client, &ping, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        let frame = read_frame(&mut client, DEFAULT_MAX_FRAME_BYTES).await.unwrap().unwrap();
        let response: Response = decode(&frame).unwrap();
        assert_eq!(response.result, Some(ResponseBody::Bool(true)));

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        use tokio::io::AsyncWriteExt;

        let (mut client, server) = tokio::io::duplex(4096);
        let ctx = ConnectionContext::new(1, None);
        let task = tokio::spawn(serve_connection(broker(), server, ctx, 1024));

        client.write_all(&4096u32.to_be_bytes()).await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Protocol(_))));
    }
}
