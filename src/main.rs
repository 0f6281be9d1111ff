// SPDX-License-Identifier: GPL-3.0-or-later

//! Tether analysis server.
//!
//! Speaks the binary request/callback protocol over stdio: the editor-side
//! client sends requests on stdin and reads responses on stdout, while the
//! server may call back to the client for file system and module
//! resolution answers mid-request. Logs go to stderr so the transport
//! stays clean.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether::config::Config;
use tether::server::{Server, ServerOptions};

/// Command-line arguments for Tether.
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Language analysis backend speaking a binary request/callback protocol")]
#[command(version)]
struct Args {
    /// Path to configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for the analysis session.
    /// Overrides the config file if set.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Location of the default libraries (e.g., "bundled:///libs").
    #[arg(long)]
    default_library_path: Option<String>,

    /// On-disk directory backing `bundled://` paths.
    #[arg(long)]
    bundled_root: Option<PathBuf>,
}

/// Entry point for the Tether binary.
///
/// # Errors
///
/// Returns an error if configuration fails to load or the connection dies
/// on a protocol or transport failure.
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tether=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Load configuration, then apply CLI overrides
    let mut config = Config::load(args.config)?;
    if let Some(cwd) = args.cwd {
        config.cwd = Some(cwd);
    }
    if let Some(path) = args.default_library_path {
        config.default_library_path = path;
    }
    if let Some(root) = args.bundled_root {
        config.bundled_root = Some(root);
    }

    let cwd = match config.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    info!(
        cwd = %cwd.display(),
        default_library_path = %config.default_library_path,
        "starting tether server on stdio"
    );

    let options = ServerOptions {
        cwd,
        default_library_path: config.default_library_path,
    };
    let mut server = Server::new(std::io::stdin(), std::io::stdout(), options);

    server.serve()?;
    info!("client disconnected");
    Ok(())
}
