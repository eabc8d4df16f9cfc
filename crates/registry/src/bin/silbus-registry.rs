//! Standalone registry process.

use anyhow::Context;
use clap::Parser;
use silbus_registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "silbus-registry", about = "Rendezvous registry for silbus simulations")]
struct Args {
    /// URI to listen on.
    #[arg(long, default_value = "silkit://0.0.0.0:8500")]
    listen_uri: String,

    /// Log filter (tracing env-filter syntax).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .context("invalid --log-level filter")?,
        )
        .init();

    let _registry =
        Registry::start(&args.listen_uri).context("could not start the registry")?;

    // Serve until the process is terminated.
    loop {
        std::thread::park();
    }
}
