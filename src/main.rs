//! cmdstalk - main entry point.
//!
//! Wires the interrupt handler, the dispatcher, and the configured tubes
//! together, then blocks until every broker has exited.

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cmdstalk::broker::Dispatcher;
use cmdstalk::cli::Options;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmdstalk=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = Options::parse();

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt. quitting.");
            interrupt.cancel();
        }
    });

    let dispatcher = Dispatcher::new(&cancel, &opts.address, &opts.cmd, opts.per_tube, opts.max_jobs);

    if opts.all {
        if let Err(error) = dispatcher.run_all_tubes().await {
            tracing::error!(%error, address = %opts.address, "failed to start tube discovery");
            std::process::exit(1);
        }
    } else {
        dispatcher.run_tubes(&opts.tubes).await;
    }

    dispatcher.wait().await;
}
