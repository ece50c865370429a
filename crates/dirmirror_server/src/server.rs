//! Main sync server.

use crate::broadcaster::Broadcaster;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::registry::{ClientRegistry, Session};
use bytes::BytesMut;
use dirmirror_protocol::{Frame, FrameDecoder, FrameLimits, IgnoreRules, SyncMessage};
use dirmirror_watcher::{DirectoryWatcher, EventTranslator, RawEvent};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// The sync server.
///
/// Owns the watched tree and the listening socket. `bind` fails if the
/// root cannot be watched or the address cannot be bound; once running,
/// per-connection failures only end the affected session.
///
/// # Example
///
/// ```no_run
/// use dirmirror_server::{ServerConfig, SyncServer};
///
/// # async fn run() -> dirmirror_server::ServerResult<()> {
/// let config = ServerConfig::new("0.0.0.0:7878".parse().unwrap(), "/srv/tree");
/// let server = SyncServer::bind(config).await?;
/// server.run().await
/// # }
/// ```
pub struct SyncServer {
    config: ServerConfig,
    listener: TcpListener,
    watcher: DirectoryWatcher,
    registry: Arc<ClientRegistry>,
}

impl SyncServer {
    /// Starts watching the root and binds the listening socket.
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        let watcher = DirectoryWatcher::new(&config.root)?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let registry = Arc::new(ClientRegistry::from_config(&config));

        info!(
            root = %watcher.root().display(),
            addr = %config.bind_addr,
            watches = watcher.table().len(),
            "server ready"
        );

        Ok(Self {
            config,
            listener,
            watcher,
            registry,
        })
    }

    /// Returns the address actually bound.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the session registry.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs until the process is stopped.
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Runs until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            config,
            listener,
            watcher,
            registry,
        } = self;

        // Nothing larger than a mirror will accept is ever sent.
        let translator = EventTranslator::new(watcher.root(), config.rename_window)
            .with_max_file_len(u64::from(config.limits.max_field_len));
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let _pipeline = AbortOnDrop(tokio::spawn(run_pipeline(
            Pipeline {
                watcher,
                translator,
            },
            broadcaster,
            config.expiry_tick,
        )));

        let settings = ConnectionSettings {
            limits: config.limits,
            handshake_timeout: config.handshake_timeout,
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if registry.is_full() {
                            warn!(%peer, max = registry.max_sessions(), "session limit reached, refusing");
                            continue;
                        }
                        let registry = Arc::clone(&registry);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, registry, settings).await {
                                warn!(%peer, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                },
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
            }
        }

        for session in registry.snapshot() {
            registry.remove(session.id());
        }
        Ok(())
    }
}

/// Stops the pipeline when the accept loop ends, however it ends.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    limits: FrameLimits,
    handshake_timeout: Duration,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ClientRegistry>,
    settings: ConnectionSettings,
) -> ServerResult<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let mut decoder = FrameDecoder::new(settings.limits);
    let mut buf = BytesMut::with_capacity(4096);

    let rules = tokio::time::timeout(
        settings.handshake_timeout,
        read_handshake(&mut reader, &mut decoder, &mut buf),
    )
    .await
    .map_err(|_| ServerError::HandshakeTimeout)??;

    debug!(%peer, rules = %rules.to_wire(), "handshake received");
    let session = registry.admit(peer.to_string(), rules, writer)?;
    let result = watch_liveness(&mut reader, &mut decoder, &mut buf, &session).await;
    registry.remove(session.id());
    result
}

async fn read_handshake<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
) -> ServerResult<IgnoreRules>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return match frame {
                Frame::Handshake(rules) => Ok(rules),
                Frame::Sync(message) => Err(ServerError::UnexpectedFrame(format!(
                    "{:?}",
                    message.tag()
                ))),
            };
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ServerError::ClosedDuringHandshake);
        }
    }
}

/// Reads until the peer closes or the session is released.
///
/// Mirrors send nothing after the handshake; anything that does arrive
/// must still be well formed.
async fn watch_liveness<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    buf: &mut BytesMut,
    session: &Session,
) -> ServerResult<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        while decoder.decode(buf)?.is_some() {
            debug!(session = %session.id(), "ignoring frame from mirror");
        }
        tokio::select! {
            _ = session.closed() => return Ok(()),
            read = reader.read_buf(buf) => {
                if read? == 0 {
                    debug!(session = %session.id(), "peer closed");
                    return Ok(());
                }
            }
        }
    }
}

/// Watcher and translator, moved onto a blocking thread for each step.
struct Pipeline {
    watcher: DirectoryWatcher,
    translator: EventTranslator,
}

impl Pipeline {
    /// Stats, reads and watch registration all happen in here.
    fn step(&mut self, event: Option<RawEvent>) -> Vec<SyncMessage> {
        let now = Instant::now();
        match event {
            Some(event) => self.translator.process(event, &mut self.watcher, now),
            None => self.translator.expire_pending(&mut self.watcher, now),
        }
    }
}

async fn run_pipeline(mut pipeline: Pipeline, broadcaster: Broadcaster, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            event = pipeline.watcher.next_event() => match event {
                Some(event) => Some(event),
                None => {
                    error!("watch backend stopped");
                    break;
                }
            },
            _ = ticker.tick(), if pipeline.translator.pending_renames() > 0 => None,
        };

        let stepped = tokio::task::spawn_blocking(move || {
            let messages = pipeline.step(event);
            (pipeline, messages)
        })
        .await;
        let messages = match stepped {
            Ok((returned, messages)) => {
                pipeline = returned;
                messages
            }
            Err(e) => {
                error!(error = %e, "pipeline step failed");
                break;
            }
        };
        for message in &messages {
            publish(&broadcaster, message);
        }
    }
}

fn publish(broadcaster: &Broadcaster, message: &SyncMessage) {
    if let Err(e) = broadcaster.broadcast(message) {
        warn!(path = message.path(), error = %e, "cannot publish change");
    }
}
