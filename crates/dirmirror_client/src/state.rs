//! Mirror client state machine.

use crate::applier::{ApplyStats, MirrorApplier};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use bytes::BytesMut;
use dirmirror_protocol::{encode_frame, Frame, FrameDecoder, SyncMessage};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// The current state of a mirror client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Establishing the TCP connection, possibly retrying.
    Connecting,
    /// Sending the ignore rules.
    Handshake,
    /// Applying frames as they arrive.
    Streaming,
    /// The connection has ended.
    Closed,
}

impl ClientState {
    /// Returns true while a connection is being set up or used.
    pub fn is_active(&self) -> bool {
        !matches!(self, ClientState::Closed)
    }
}

/// Connects to a server and replays its changes onto the mirror root.
pub struct MirrorClient {
    config: ClientConfig,
    applier: Arc<MirrorApplier>,
    state: RwLock<ClientState>,
}

impl MirrorClient {
    /// Creates a client, preparing the mirror root.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let applier = MirrorApplier::open(&config.mirror_root)?;
        Ok(Self {
            config,
            applier: Arc::new(applier),
            state: RwLock::new(ClientState::Connecting),
        })
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Returns the applier counters.
    pub fn stats(&self) -> ApplyStats {
        self.applier.stats()
    }

    /// Returns the applier.
    pub fn applier(&self) -> &Arc<MirrorApplier> {
        &self.applier
    }

    fn set_state(&self, state: ClientState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        debug!(from = ?previous, to = ?state, "client state");
    }

    /// Connects with retry, then streams until the server closes.
    pub async fn run(&self) -> ClientResult<()> {
        let stream = self.connect().await?;
        self.run_on(stream).await
    }

    /// Connects to the server, retrying with backoff.
    pub async fn connect(&self) -> ClientResult<TcpStream> {
        self.set_state(ClientState::Connecting);
        let retry = &self.config.retry;
        let mut last_error = ClientError::transport_fatal("no attempt made");

        for attempt in 0..retry.max_attempts {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match TcpStream::connect(&self.config.server_addr).await {
                Ok(stream) => {
                    info!(addr = %self.config.server_addr, attempt, "connected");
                    return Ok(stream);
                }
                Err(e) => {
                    let err = classify_connect_error(e);
                    warn!(
                        addr = %self.config.server_addr,
                        attempt,
                        error = %err,
                        "connect failed"
                    );
                    if !err.is_retryable() {
                        self.set_state(ClientState::Closed);
                        return Err(err);
                    }
                    last_error = err;
                }
            }
        }

        self.set_state(ClientState::Closed);
        Err(ClientError::RetriesExhausted {
            attempts: retry.max_attempts,
            last_error: last_error.to_string(),
        })
    }

    /// Runs the handshake and the streaming loop over an established stream.
    ///
    /// Returns `Ok(())` when the server closes the connection cleanly.
    pub async fn run_on<S>(&self, stream: S) -> ClientResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.stream(stream).await;
        self.set_state(ClientState::Closed);
        let stats = self.stats();
        info!(
            applied = stats.applied,
            rejected = stats.rejected,
            failed = stats.failed,
            "connection closed"
        );
        result
    }

    async fn stream<S>(&self, mut stream: S) -> ClientResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.set_state(ClientState::Handshake);
        let handshake = encode_frame(&Frame::Handshake(self.config.ignore_rules.clone()))?;
        stream.write_all(&handshake).await?;
        stream.flush().await?;

        self.set_state(ClientState::Streaming);
        let mut decoder = FrameDecoder::new(self.config.limits);
        let mut buf = BytesMut::with_capacity(64 * 1024);

        loop {
            while let Some(frame) = decoder.decode(&mut buf)? {
                match frame {
                    Frame::Sync(message) => self.apply(message).await?,
                    Frame::Handshake(_) => return Err(ClientError::UnexpectedHandshake),
                }
            }
            if stream.read_buf(&mut buf).await? == 0 {
                if !buf.is_empty() {
                    warn!(pending = buf.len(), "server closed mid-frame");
                }
                return Ok(());
            }
        }
    }

    async fn apply(&self, message: SyncMessage) -> ClientResult<()> {
        let applier = Arc::clone(&self.applier);
        let result = tokio::task::spawn_blocking(move || {
            let result = applier.handle(&message);
            (message, result)
        })
        .await
        .map_err(|e| ClientError::Io(std::io::Error::other(e)))?;

        if let (message, Err(e)) = result {
            warn!(tag = ?message.tag(), path = message.path(), error = %e, "frame dropped");
        }
        Ok(())
    }
}

fn classify_connect_error(e: std::io::Error) -> ClientError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::InvalidInput | ErrorKind::AddrNotAvailable | ErrorKind::Unsupported => {
            ClientError::transport_fatal(e.to_string())
        }
        _ => ClientError::transport_retryable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use dirmirror_protocol::{FrameLimits, IgnoreRules};
    use std::time::Duration;

    fn client(dir: &tempfile::TempDir, addr: &str) -> MirrorClient {
        let rules: IgnoreRules = ["tmp"].into_iter().collect();
        let config = ClientConfig::new(addr, dir.path().join("mirror"))
            .with_ignore_rules(rules)
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(10))
                    .without_jitter(),
            );
        MirrorClient::new(config).unwrap()
    }

    async fn send(peer: &mut tokio::io::DuplexStream, frame: Frame) {
        peer.write_all(&encode_frame(&frame).unwrap()).await.unwrap();
    }

    #[test]
    fn state_activity() {
        assert!(ClientState::Streaming.is_active());
        assert!(!ClientState::Closed.is_active());
    }

    #[tokio::test]
    async fn handshake_then_apply() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, "127.0.0.1:1");
        assert_eq!(client.state(), ClientState::Connecting);

        let (local, mut peer) = tokio::io::duplex(1 << 16);
        let server = async move {
            let mut decoder = FrameDecoder::new(FrameLimits::default());
            let mut buf = BytesMut::new();
            let rules = loop {
                if let Some(Frame::Handshake(rules)) = decoder.decode(&mut buf).unwrap() {
                    break rules;
                }
                peer.read_buf(&mut buf).await.unwrap();
            };
            assert!(rules.contains("tmp"));

            send(&mut peer, SyncMessage::CreateDir { path: "d".into() }.into()).await;
            send(&mut peer, SyncMessage::create_file("d/f.txt", b"abc".to_vec()).into()).await;
            send(&mut peer, SyncMessage::create_file("../x", b"no".to_vec()).into()).await;
        };

        let (result, ()) = tokio::join!(client.run_on(local), server);
        result.unwrap();

        assert_eq!(client.state(), ClientState::Closed);
        let root = client.applier().root();
        assert_eq!(std::fs::read(root.join("d/f.txt")).unwrap(), b"abc");
        assert_eq!(
            client.stats(),
            ApplyStats {
                applied: 2,
                rejected: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn handshake_while_streaming_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, "127.0.0.1:1");
        let (local, mut peer) = tokio::io::duplex(1 << 16);

        send(&mut peer, Frame::Handshake(IgnoreRules::new())).await;
        let err = client.run_on(local).await.unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedHandshake));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir, "127.0.0.1:1");
        let (local, mut peer) = tokio::io::duplex(1 << 16);

        peer.write_all(b"Q\0\0\0\0").await.unwrap();
        let err = client.run_on(local).await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_gives_up_after_attempts() {
        let dir = tempfile::tempdir().unwrap();
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = client(&dir, &addr.to_string());

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }
}
