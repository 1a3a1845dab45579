// FobLink host runtime: run a car or fob endpoint over TCP, or drive an
// unlock as the client side.

mod car;
mod config;
mod fob;
mod secrets_file;
mod tcp;

use foblink_core::secrets::SecretSource;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    for arg in &args {
        if arg == "--version" || arg == "-V" {
            println!("foblink-host {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let command = args.first().map(String::as_str);
    match command {
        Some("car") | Some("fob") | Some("unlock") => {}
        _ => {
            eprintln!("usage: foblink-host <car|fob|unlock [addr]>");
            std::process::exit(2);
        }
    }

    let secrets = secrets_file::FileSecretSource::new(&cfg.secrets_path).load()?;
    match command {
        Some("car") => car::run(&cfg, secrets),
        Some("fob") => fob::run(&cfg, secrets),
        Some("unlock") => {
            let default_addr = format!("127.0.0.1:{}", cfg.listen_port);
            let addr = args.get(1).map(String::as_str).unwrap_or(&default_addr);
            fob::unlock(&cfg, secrets, addr)
        }
        _ => unreachable!(),
    }
}
