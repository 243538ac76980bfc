//! Per-transfer worker process spawned by the dispatcher. Takes the
//! transfer request as its single JSON argument, executes it end-to-end
//! and reports the outcome through its exit code: 0 on success, 2 on
//! fatal I/O failure, 3 on anything unexpected.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use archived::error::{EXIT_FATAL_IO, EXIT_OK, EXIT_UNEXPECTED};
use archived::protocol::TransferRequest;
use archived::{ArchiveError, Config, LocalFs, StatusServer, Transfer};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let Some(payload) = std::env::args().nth(1) else {
        eprintln!("usage: archive-worker <request-json>");
        return EXIT_UNEXPECTED;
    };

    let request: TransferRequest = match serde_json::from_str(&payload) {
        Ok(req) => req,
        Err(e) => {
            eprintln!("invalid request: {}", e);
            return EXIT_UNEXPECTED;
        }
    };

    let config = match Config::load().await {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration failed: {}", e);
            return EXIT_UNEXPECTED;
        }
    };
    if let Err(e) = config.ensure_directories().await {
        eprintln!("failed to create scratch directories: {}", e);
        return EXIT_FATAL_IO;
    }

    let mut transfer = match Transfer::new(&request, config.clone(), Arc::new(LocalFs::new())) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("failed to create transfer: {}", e);
            return e.exit_code();
        }
    };

    // The worker logs into its scratch log file; the finalizer ships the
    // file back next to the manifest when the transfer ends.
    let log_file = match std::fs::File::create(transfer.log_file()) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to create log file: {}", e);
            return EXIT_FATAL_IO;
        }
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "archived=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false),
        )
        .init();

    info!("Worker pid={} starting request {:?}", std::process::id(), request);

    let status_server = match StatusServer::spawn(
        config.status_socket(transfer.uuid()),
        transfer.identity(),
        transfer.status_handle(),
    ) {
        Ok(server) => Some(server),
        Err(e) => {
            // The transfer can proceed without a status channel; the
            // dispatcher will see it through the child handle.
            error!("Failed to start status channel: {}", e);
            None
        }
    };

    let result = transfer.execute().await;

    if let Some(server) = status_server {
        server.shutdown();
    }

    match result {
        Ok(()) => {
            info!("Transfer completed successfully");
            EXIT_OK
        }
        Err(ArchiveError::NothingToDo) => {
            info!("Nothing to retry, transfer already complete");
            EXIT_OK
        }
        Err(e) => {
            error!("Transfer failed: {}", e);
            e.exit_code()
        }
    }
}
