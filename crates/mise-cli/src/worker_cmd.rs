//! `mise worker` command: run the finalization and materialization sweeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use mise_core::Engine;
use mise_core::worker::{SweepReport, Worker};

fn print_report(kind: &str, report: &SweepReport) {
    println!(
        "{kind}: {} due, {} processed, {} skipped, {} failed",
        report.due, report.processed, report.skipped, report.failed
    );
}

/// Run the worker until interrupted, or one pass of each sweep with `once`.
pub async fn run_worker(engine: Arc<Engine>, once: bool) -> Result<()> {
    let worker = Worker::new(engine);

    // First signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_signal.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    if once {
        let (finalized, materialized) = worker.run_once(&cancel).await?;
        print_report("finalization", &finalized);
        print_report("materialization", &materialized);
        let failed = finalized.failed + materialized.failed;
        if failed > 0 {
            anyhow::bail!("{failed} plan(s) backed off after exhausting retries");
        }
        return Ok(());
    }

    println!("Worker {} running (Ctrl+C to stop).", worker.holder());
    worker.run(cancel).await?;
    println!("Worker stopped.");
    Ok(())
}
