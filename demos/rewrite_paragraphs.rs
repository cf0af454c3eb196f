//! Rewrite a handful of paragraphs through an OpenAI-compatible endpoint.
//!
//! ```text
//! REWRITE_API_KEY=sk-... RUST_LOG=rewrite_queue=debug \
//!     cargo run --example rewrite_paragraphs
//! ```

use rewrite_queue::*;
use std::collections::HashSet;
use std::io::Write;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const PARAGRAPHS: &[(&str, &str, Priority)] = &[
    (
        "intro",
        "Notwithstanding the foregoing, the parties hereto agree to cooperate in good faith.",
        Priority::High,
    ),
    (
        "body",
        "The quarterly numbers was not great but we think next quarter will be more better.",
        Priority::Normal,
    ),
    (
        "footnote",
        "See appendix B for the full methodology, which are described there in detail.",
        Priority::Low,
    ),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let completion = CompletionConfig::from_env()
        .with_system_prompt("Rewrite the text in clear, plain English. Reply with the rewrite only.")
        .with_temperature(0.3);
    completion.validate()?;

    let queue = QueueManager::new(
        QueueConfig::builder().with_max_concurrent(2).with_max_retries(2).build(),
        completion,
    );
    let mut events = queue.subscribe();

    for (id, text, priority) in PARAGRAPHS {
        queue.submit(*id, *text, *priority);
    }
    queue.start();

    let mut remaining: HashSet<&str> = PARAGRAPHS.iter().map(|(id, _, _)| *id).collect();
    while !remaining.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                eprintln!("(missed {} events)", missed);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match &event {
            QueueEvent::Started { job_id, attempt } => {
                println!("\n[{}] attempt {}", job_id, attempt);
            }
            QueueEvent::Delta { delta, .. } => {
                print!("{}", delta);
                std::io::stdout().flush()?;
            }
            QueueEvent::RetryScheduled {
                job_id,
                error,
                delay_ms,
            } => {
                println!("\n[{}] {} (retrying in {}ms)", job_id, error, delay_ms);
            }
            QueueEvent::Completed {
                job_id, progress, ..
            } => {
                println!(
                    "\n[{}] done: {} bytes at {:.0} B/s",
                    job_id, progress.bytes_received, progress.bytes_per_second
                );
                remaining.remove(job_id.as_str());
            }
            QueueEvent::Failed { job_id, error } => {
                println!("\n[{}] failed: {}", job_id, error);
                remaining.remove(job_id.as_str());
            }
            _ => {}
        }
    }

    let stats = queue.stats();
    println!(
        "\nProcessed {} ({} failed), average {:.0}ms",
        stats.total_processed, stats.total_failed, stats.average_processing_time_ms
    );
    Ok(())
}
