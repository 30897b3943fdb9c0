use std::process::ExitCode;

/// Grace period after a shutdown signal before force-exiting (seconds).
const SHUTDOWN_GRACE_SECS: u64 = 5;

#[tokio::main]
async fn main() -> ExitCode {
    // `handle` may be mid-way through a long input file; give in-flight
    // recovery a moment to finish, then exit.
    tokio::spawn(async {
        shutdown_signal().await;
        eprintln!("\nReceived shutdown signal, finishing current failure...");

        tokio::time::sleep(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        eprintln!("Shutdown grace period expired, forcing exit.");
        std::process::exit(i32::from(selfmend::errors::EXIT_ERROR));
    });

    match selfmend::cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(selfmend::errors::get_exit_code(&e))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(_) => {
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
