//! skiffd - the skiff file server daemon.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use skiff::logger::TextLogger;
use skiff::proto::{DEFAULT_DISCOVERY_PORT, DEFAULT_PORT};
use skiff::server;
use skiff::sharing::{ServerConfig, SharedSecret, Sharing};

#[derive(Parser, Debug)]
#[command(author, version, about = "skiffd - serve directories and files as named sharings")]
struct Opts {
    /// Bind address (host:port)
    #[arg(long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
    bind: String,

    /// Sharing spec, repeatable: NAME=PATH[:ro] or a bare PATH[:ro]
    #[arg(long = "sharing", required = true)]
    sharings: Vec<String>,

    /// Require this password on connect
    #[arg(long)]
    password: Option<String>,

    /// Advertised server name (defaults to the hostname)
    #[arg(long)]
    name: Option<String>,

    /// Disable the UDP discovery responder
    #[arg(long)]
    no_discovery: bool,

    /// UDP discovery port
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Append an operation log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let mut sharings = Vec::with_capacity(opts.sharings.len());
    for spec in &opts.sharings {
        let sharing = Sharing::from_spec(spec).with_context(|| format!("sharing {:?}", spec))?;
        sharings.push(sharing);
    }
    for (i, a) in sharings.iter().enumerate() {
        if sharings[..i].iter().any(|b| b.name == a.name) {
            anyhow::bail!("duplicate sharing name {:?}", a.name);
        }
    }

    let mut config = ServerConfig::new(sharings);
    config.bind = opts.bind;
    if let Some(name) = opts.name {
        config.name = name;
    }
    if let Some(password) = opts.password {
        config.auth = Arc::new(SharedSecret::new(password));
    }
    config.discovery_port = if opts.no_discovery {
        None
    } else {
        Some(opts.discovery_port)
    };
    if let Some(path) = &opts.log_file {
        config.logger = Arc::new(
            TextLogger::new(path)
                .with_context(|| format!("open log file {}", path.display()))?,
        );
    }

    server::serve(Arc::new(config))
}
