use std::sync::Arc;

use tunmux::config::Config;
use tunmux::report;
use tunmux::session::{ClientSession, Stats};
use tunmux::transport::MuxListener;

use crate::cmd::{dialer, io_settings, shutdown_signal};
use crate::exit::{config_error, transport_error, CliResult, SUCCESS};

pub async fn run(config: &Config) -> CliResult<i32> {
    let section = config.client().map_err(config_error)?;
    let (frame, channel) = io_settings(config)?;
    let dialer = dialer(config, section.tls.as_deref(), section.server_name())?
        .with_connect_timeout(config.dial_timeout().map_err(config_error)?);

    let stats = Arc::new(Stats::new());
    let session = Arc::new(
        ClientSession::new(dialer, section.address.as_str(), Arc::clone(&stats))
            .with_frame_config(frame)
            .with_channel_config(channel),
    );

    // Bind every listener before serving so a bad entry fails the whole run.
    let mut listeners = Vec::with_capacity(config.channel.len());
    for entry in &config.channel {
        let listener = MuxListener::bind(&entry.local, None)
            .await
            .map_err(|err| transport_error("local bind failed", err))?;
        listeners.push((listener, entry.remote.clone()));
    }
    for (listener, remote) in listeners {
        tokio::spawn(Arc::clone(&session).serve_listener(listener, remote));
    }

    let interval = config.stats_interval().map_err(config_error)?;
    tokio::spawn(report::run(stats, interval, "client"));

    shutdown_signal().await?;
    Ok(SUCCESS)
}
