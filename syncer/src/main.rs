use telemetry::init_tracing;
use tracing::error;

use crate::core::start_syncer;

mod config;
mod core;

#[tokio::main]
async fn main() {
    let app_name = env!("CARGO_BIN_NAME");

    let _log_flusher = match init_tracing(app_name) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("failed to initialize telemetry: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = start_syncer().await {
        error!(error = %err, "syncer run failed");
        std::process::exit(err.exit_code());
    }
}
