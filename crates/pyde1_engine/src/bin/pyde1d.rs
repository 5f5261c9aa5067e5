//! `pyde1d` — the pyde1 daemon process. Thin on purpose: parse the CLI,
//! maybe print the version and exit, set up logging, load configuration,
//! hand off to the library.

use pyde1_engine::options::{load_config, maybe_print_version, PyDe1CliArguments};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string())),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: PyDe1CliArguments = argh::from_env();
    if maybe_print_version(&args) {
        return Ok(());
    }

    setup_logging(args.log_level());

    let config = load_config(&args).map_err(|e| {
        eprintln!("could not load configuration: {e}");
        e
    })?;

    tracing::info!(
        host = %config.http.server_host,
        port = config.http.server_port,
        mqtt_enabled = config.mqtt.enabled,
        "starting pyde1 daemon",
    );

    if let Err(e) = pyde1_engine::run(config).await {
        tracing::error!(error = %e, "pyde1 daemon exited with an error");
        return Err(Box::new(e));
    }
    Ok(())
}
