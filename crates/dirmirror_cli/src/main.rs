//! dirmirror CLI
//!
//! Mirrors a directory tree to any number of receivers over TCP.
//!
//! # Commands
//!
//! - `serve` - Watch a directory and stream its changes to mirrors
//! - `mirror` - Connect to a server and replay its changes locally

mod commands;

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Live one-way directory mirroring.
#[derive(Parser, Debug)]
#[command(name = "dirmirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a directory and stream its changes to connected mirrors
    Serve {
        /// Directory to watch
        root: PathBuf,

        /// Port to listen on
        #[arg(short, long)]
        port: u16,

        /// Maximum number of concurrent mirrors
        #[arg(short = 'n', long, default_value = "64")]
        max_sessions: usize,

        /// Address to bind to
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Frames buffered per mirror before it is disconnected
        #[arg(long, default_value = "256")]
        queue_capacity: usize,

        /// Per-frame send timeout in milliseconds
        #[arg(long, default_value = "5000")]
        send_timeout_ms: u64,

        /// How long a rename source waits for its destination, in milliseconds
        #[arg(long, default_value = "250")]
        rename_window_ms: u64,

        /// Largest accepted inbound field, in bytes
        #[arg(long)]
        max_field_len: Option<u32>,
    },

    /// Connect to a server and replay its changes into a local directory
    Mirror {
        /// Server host name or address
        host: String,

        /// Server port
        port: u16,

        /// Local directory to mirror into
        mirror_root: PathBuf,

        /// File listing extensions to skip, one per line
        ignore_file: PathBuf,

        /// Connection attempts before giving up
        #[arg(long, default_value = "5")]
        attempts: u32,

        /// Delay before the first retry, in milliseconds
        #[arg(long, default_value = "1000")]
        retry_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            root,
            port,
            max_sessions,
            bind,
            queue_capacity,
            send_timeout_ms,
            rename_window_ms,
            max_field_len,
        } => {
            let options = commands::serve::ServeOptions {
                root,
                bind,
                port,
                max_sessions,
                queue_capacity,
                send_timeout_ms,
                rename_window_ms,
                max_field_len,
            };
            commands::serve::run(options).await?;
        }
        Commands::Mirror {
            host,
            port,
            mirror_root,
            ignore_file,
            attempts,
            retry_delay_ms,
        } => {
            let options = commands::mirror::MirrorOptions {
                host,
                port,
                mirror_root,
                ignore_file,
                attempts,
                retry_delay_ms,
            };
            commands::mirror::run(options).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_serve_with_defaults() {
        let cli = Cli::try_parse_from(["dirmirror", "serve", "/srv/tree", "--port", "7878"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Commands::Serve {
                root,
                port,
                max_sessions,
                queue_capacity,
                max_field_len,
                ..
            } => {
                assert_eq!(root, PathBuf::from("/srv/tree"));
                assert_eq!(port, 7878);
                assert_eq!(max_sessions, 64);
                assert_eq!(queue_capacity, 256);
                assert_eq!(max_field_len, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_mirror_positionals() {
        let cli = Cli::try_parse_from([
            "dirmirror",
            "-v",
            "mirror",
            "example.org",
            "7878",
            "/var/mirror",
            "ignore.txt",
            "--attempts",
            "2",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Mirror {
                host,
                port,
                attempts,
                retry_delay_ms,
                ..
            } => {
                assert_eq!(host, "example.org");
                assert_eq!(port, 7878);
                assert_eq!(attempts, 2);
                assert_eq!(retry_delay_ms, 1000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_requires_port() {
        assert!(Cli::try_parse_from(["dirmirror", "serve", "/srv/tree"]).is_err());
    }
}
