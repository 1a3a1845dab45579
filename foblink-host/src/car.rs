//! Car runner: accept fob connections and serve the command loop.

use std::net::TcpListener;

use foblink_core::device::CarDevice;
use foblink_core::channel::SecureChannel;
use foblink_core::secrets::ProvisionedSecrets;

use crate::config::Config;
use crate::tcp::TcpLink;

/// Serve connections one at a time; the car is a single half-duplex device
/// and its feature state is not shared across concurrent links.
pub fn serve(listener: TcpListener, cfg: &Config, secrets: ProvisionedSecrets) -> anyhow::Result<()> {
    let mut car = CarDevice::new(secrets)?;
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        tracing::info!(?peer, "fob connected");
        let mut channel = SecureChannel::new(TcpLink::new(stream), cfg.protocol());
        if let Err(e) = car.serve_connection(&mut channel) {
            tracing::warn!(?peer, error = %e, "connection ended with error");
        }
        channel.close();
    }
    Ok(())
}

pub fn run(cfg: &Config, secrets: ProvisionedSecrets) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))?;
    tracing::info!(port = cfg.listen_port, "car listening");
    serve(listener, cfg, secrets)
}
