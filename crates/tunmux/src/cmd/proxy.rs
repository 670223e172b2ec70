use std::sync::Arc;

use tunmux::config::{host_of, Config};
use tunmux::proxy::{PassthroughProxy, Remote};
use tunmux::report;
use tunmux::session::Stats;
use tunmux::transport::MuxListener;

use crate::cmd::{acceptor, dialer, shutdown_signal};
use crate::exit::{config_error, transport_error, CliResult, SUCCESS};

pub async fn run(config: &Config) -> CliResult<i32> {
    let dial_timeout = config.dial_timeout().map_err(config_error)?;
    let stats = Arc::new(Stats::new());

    let mut proxies = Vec::with_capacity(config.proxy.len());
    for entry in &config.proxy {
        let remotes = entry
            .remote
            .iter()
            .map(|addr| -> CliResult<Remote> {
                let dialer = dialer(config, entry.remote_tls.as_deref(), host_of(addr))?;
                Ok(Remote {
                    addr: addr.clone(),
                    dialer: dialer.with_connect_timeout(dial_timeout),
                })
            })
            .collect::<CliResult<Vec<_>>>()?;

        let acceptor = acceptor(config, entry.local_tls.as_deref())?;
        let listener = MuxListener::bind(&entry.local, acceptor)
            .await
            .map_err(|err| transport_error("proxy bind failed", err))?;
        proxies.push(PassthroughProxy::new(listener, remotes, Arc::clone(&stats)));
    }
    for proxy in proxies {
        tokio::spawn(Arc::new(proxy).run());
    }

    let interval = config.stats_interval().map_err(config_error)?;
    tokio::spawn(report::run(stats, interval, "proxy"));

    shutdown_signal().await?;
    Ok(SUCCESS)
}
