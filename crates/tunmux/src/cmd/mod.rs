use std::path::Path;

use clap::{Args, Subcommand};
use tracing::info;
use tunmux::config::{Config, Mode};
use tunmux::frame::FrameConfig;
use tunmux::session::ChannelConfig;
use tunmux::transport::{client_context, server_context, Dialer, TlsAcceptor};

use crate::exit::{config_error, io_error, transport_error, CliResult};

pub mod client;
pub mod proxy;
pub mod server;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept tunnel links and relay their channels to destinations.
    Server,
    /// Forward local listeners through the tunnel to remote destinations.
    Client,
    /// Run plain TCP passthrough proxies with remote failover.
    Proxy,
    /// Show version information.
    Version(VersionArgs),
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub async fn run(command: Command, config_path: &Path) -> CliResult<i32> {
    match command {
        Command::Server => server::run(&load(config_path, Mode::Server)?).await,
        Command::Client => client::run(&load(config_path, Mode::Client)?).await,
        Command::Proxy => proxy::run(&load(config_path, Mode::Proxy)?).await,
        Command::Version(args) => version::run(args),
    }
}

fn load(path: &Path, mode: Mode) -> CliResult<Config> {
    let config = Config::load(path).map_err(config_error)?;
    config.validate(mode).map_err(config_error)?;
    info!(config = %path.display(), ?mode, "configuration loaded");
    Ok(config)
}

/// Frame and channel settings derived from the configured timeout. Link data
/// waits for a full channel queue a quarter of that at most.
fn io_settings(config: &Config) -> CliResult<(FrameConfig, ChannelConfig)> {
    let timeout = config.timeout().map_err(config_error)?;
    Ok((
        FrameConfig::with_timeout(timeout),
        ChannelConfig::for_link_timeout(timeout),
    ))
}

fn acceptor(config: &Config, profile: Option<&str>) -> CliResult<Option<TlsAcceptor>> {
    let Some(name) = profile else {
        return Ok(None);
    };
    let files = config.tls_files(name).map_err(config_error)?;
    let acceptor = server_context(&files)
        .map_err(|err| transport_error(&format!("tls profile `{name}`"), err))?;
    Ok(Some(acceptor))
}

fn dialer(config: &Config, profile: Option<&str>, server_name: &str) -> CliResult<Dialer> {
    let Some(name) = profile else {
        return Ok(Dialer::plain());
    };
    let files = config.tls_files(name).map_err(config_error)?;
    let tls = client_context(&files, server_name)
        .map_err(|err| transport_error(&format!("tls profile `{name}`"), err))?;
    Ok(Dialer::with_tls(tls))
}

async fn shutdown_signal() -> CliResult<()> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| io_error("signal handler setup failed", err))?;
    info!("shutting down");
    Ok(())
}
