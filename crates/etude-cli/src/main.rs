use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use etude_core::{Config, Dispatch, FormDecoding, Server, syscalls};
use std::path::PathBuf;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Event-driven static HTTP/1.1 server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve(Overrides),
    /// Print the effective configuration as JSON and exit
    Config(Overrides),
}

/// Settings come from `--config` if given, otherwise from `.env` and
/// `ETUDE_*` variables; flags override either.
#[derive(Args)]
struct Overrides {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long, short = 'p')]
    port: Option<u16>,
    /// 0: LT/LT, 1: conn ET, 2: listen ET, 3: both ET
    #[arg(long, short = 't')]
    trigger_mode: Option<u8>,
    /// Idle timeout in milliseconds, 0 disables eviction
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    linger: bool,
    #[arg(long, short = 'w')]
    workers: Option<usize>,
    #[arg(long)]
    credential_pool_size: Option<usize>,
    #[arg(long)]
    max_connections: Option<usize>,
    #[arg(long, short = 'r')]
    resource_dir: Option<PathBuf>,
    /// standard or legacy
    #[arg(long)]
    form_decoding: Option<FormDecoding>,
    /// pool or inline
    #[arg(long)]
    dispatch: Option<Dispatch>,
    #[arg(long)]
    no_log: bool,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Overrides {
    fn load(self) -> Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Config::from_env()?,
        };

        if let Some(v) = self.host {
            cfg.host = v;
        }
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = self.trigger_mode {
            cfg.trigger_mode = v;
        }
        if let Some(v) = self.timeout_ms {
            cfg.timeout_ms = v;
        }
        if self.linger {
            cfg.linger = true;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(v) = self.credential_pool_size {
            cfg.credential_pool_size = v;
        }
        if let Some(v) = self.max_connections {
            cfg.max_connections = v;
        }
        if let Some(v) = self.resource_dir {
            cfg.resource_dir = v;
        }
        if let Some(v) = self.form_decoding {
            cfg.form_decoding = v;
        }
        if let Some(v) = self.dispatch {
            cfg.dispatch = v;
        }
        if self.no_log {
            cfg.log_enabled = false;
        }
        if let Some(v) = self.log_level {
            cfg.log_level = v;
        }
        if let Some(v) = self.log_file {
            cfg.log_file = Some(v);
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config(overrides) => {
            let cfg = overrides.load()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            Ok(())
        }
        Commands::Serve(overrides) => serve(overrides.load()?),
    }
}

fn serve(cfg: Config) -> Result<()> {
    let _log_guard = etude_core::init_logging(&cfg)?;
    syscalls::ignore_sigpipe();

    let mut reactor = Server::new(cfg).build().context("starting server")?;
    let handle = reactor.handle();
    ctrlc::set_handler(move || {
        info!("received SIGINT, shutting down");
        handle.shutdown();
    })
    .context("installing Ctrl-C handler")?;

    reactor.run().context("reactor failed")?;
    let m = reactor.metrics().snapshot();
    info!(
        accepted = m.accepted,
        requests = m.req_count,
        bytes_sent = m.bytes_sent,
        "etude shut down"
    );
    Ok(())
}
