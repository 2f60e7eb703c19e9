use anyhow::Result;
use clap::Parser;

use nf_device_broker::app::Application;
use nf_device_broker::config::Cli;
use nf_device_broker::config::Commands;
use nf_device_broker::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => {
            logging::init();
            tracing::info!("Starting device broker daemon");

            let app = Application::new(&daemon_args);
            app.run().await
        }
    }
}
