use std::sync::Arc;

use tunmux::config::Config;
use tunmux::report;
use tunmux::session::{MuxServer, ServerOptions, Stats};
use tunmux::transport::MuxListener;

use crate::cmd::{acceptor, io_settings, shutdown_signal};
use crate::exit::{config_error, transport_error, CliResult, SUCCESS};

pub async fn run(config: &Config) -> CliResult<i32> {
    let section = config.server().map_err(config_error)?;
    let (frame, channel) = io_settings(config)?;
    let options = ServerOptions {
        frame,
        channel,
        dial_timeout: config.dial_timeout().map_err(config_error)?,
    };

    let acceptor = acceptor(config, section.tls.as_deref())?;
    let listener = MuxListener::bind(&section.address, acceptor)
        .await
        .map_err(|err| transport_error("server bind failed", err))?;

    let stats = Arc::new(Stats::new());
    let interval = config.stats_interval().map_err(config_error)?;
    tokio::spawn(report::run(Arc::clone(&stats), interval, "server"));

    let server = MuxServer::new(listener, options, stats);
    tokio::select! {
        _ = server.run() => {}
        signal = shutdown_signal() => signal?,
    }
    Ok(SUCCESS)
}
