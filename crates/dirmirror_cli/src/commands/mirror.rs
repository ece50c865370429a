//! `mirror` command.

use dirmirror_client::{ClientConfig, MirrorClient, RetryConfig};
use dirmirror_protocol::IgnoreRules;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Options for `dirmirror mirror`.
pub struct MirrorOptions {
    pub host: String,
    pub port: u16,
    pub mirror_root: PathBuf,
    pub ignore_file: PathBuf,
    pub attempts: u32,
    pub retry_delay_ms: u64,
}

/// Reads an ignore list: one extension per line, `#` starts a comment.
fn load_ignore_rules(path: &Path) -> Result<IgnoreRules, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("cannot read ignore file {}: {e}", path.display()))?;
    Ok(IgnoreRules::from_lines(&text))
}

impl MirrorOptions {
    fn into_config(self) -> Result<ClientConfig, Box<dyn std::error::Error>> {
        let rules = load_ignore_rules(&self.ignore_file)?;
        let retry = RetryConfig::new(self.attempts)
            .with_initial_delay(Duration::from_millis(self.retry_delay_ms));
        Ok(
            ClientConfig::new(format!("{}:{}", self.host, self.port), self.mirror_root)
                .with_ignore_rules(rules)
                .with_retry(retry),
        )
    }
}

/// Mirrors until the server closes the connection or the user interrupts.
pub async fn run(options: MirrorOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = options.into_config()?;
    if !config.ignore_rules.is_empty() {
        info!(rules = %config.ignore_rules.to_wire(), "ignoring extensions");
    }
    let client = MirrorClient::new(config)?;
    println!(
        "Mirroring {} into {}",
        client.config().server_addr,
        client.applier().root().display()
    );

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let stats = client.stats();
    println!(
        "Applied {} changes ({} rejected, {} failed)",
        stats.applied, stats.rejected, stats.failed
    );
    Ok(())
}
