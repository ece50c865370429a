//! `serve` command.

use dirmirror_protocol::FrameLimits;
use dirmirror_server::{ServerConfig, SyncServer};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Options for `dirmirror serve`.
pub struct ServeOptions {
    pub root: PathBuf,
    pub bind: IpAddr,
    pub port: u16,
    pub max_sessions: usize,
    pub queue_capacity: usize,
    pub send_timeout_ms: u64,
    pub rename_window_ms: u64,
    pub max_field_len: Option<u32>,
}

impl ServeOptions {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::new(SocketAddr::new(self.bind, self.port), self.root)
            .with_max_sessions(self.max_sessions)
            .with_session_queue_capacity(self.queue_capacity)
            .with_send_timeout(Duration::from_millis(self.send_timeout_ms))
            .with_rename_window(Duration::from_millis(self.rename_window_ms));
        if let Some(max) = self.max_field_len {
            config = config.with_limits(FrameLimits::new(max));
        }
        config
    }
}

/// Serves until interrupted.
pub async fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let server = SyncServer::bind(options.into_config()).await?;
    println!("Serving {} on {}", server.config().root.display(), server.local_addr()?);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("stopped");
    Ok(())
}
