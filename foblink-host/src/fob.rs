//! Fob runner: serve host pairing commands, and act as the unlock client
//! toward a car.

use std::net::{TcpListener, TcpStream};

use anyhow::Context;
use foblink_core::channel::SecureChannel;
use foblink_core::device::{request_start, FobDevice};
use foblink_core::secrets::ProvisionedSecrets;

use crate::config::Config;
use crate::tcp::TcpLink;

/// Serve host-tool connections one at a time.
pub fn serve(listener: TcpListener, cfg: &Config, secrets: ProvisionedSecrets) -> anyhow::Result<()> {
    let mut fob = FobDevice::new(secrets, cfg.throttle(), cfg.pairing_timeout());
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        tracing::info!(?peer, "host connected");
        let mut channel = SecureChannel::new(TcpLink::new(stream), cfg.protocol());
        if let Err(e) = fob.serve_connection(&mut channel) {
            tracing::warn!(?peer, error = %e, "connection ended with error");
        }
        channel.close();
    }
    Ok(())
}

pub fn run(cfg: &Config, secrets: ProvisionedSecrets) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))?;
    tracing::info!(port = cfg.listen_port, "fob listening");
    serve(listener, cfg, secrets)
}

/// Connect to a car, unlock it with the paired link key and start it.
pub fn unlock(cfg: &Config, secrets: ProvisionedSecrets, addr: &str) -> anyhow::Result<()> {
    let fob = FobDevice::new(secrets, cfg.throttle(), cfg.pairing_timeout());
    let car_id = fob
        .record()
        .map(|r| r.car_id)
        .context("fob is not paired")?;
    let stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    let mut channel = SecureChannel::new(TcpLink::new(stream), cfg.protocol());
    channel.establish_initiator(car_id)?;
    let mask = fob.request_unlock(&mut channel)?;
    println!("car {car_id} unlocked; enabled features 0b{mask:08b}");
    request_start(&mut channel, 0)?;
    println!("car started");
    channel.close();
    Ok(())
}
