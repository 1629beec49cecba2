mod intake;
mod jobs;

use std::sync::Arc;

use ephemera_broker::in_memory::{InMemoryBackend, InMemoryOptions};
use ephemera_broker::{Backend, CancellationToken, Consumer, Queue, QueueError, UuidGenerator};
use ephemera_config::{BackendKind, Config, parse_config};
use ephemera_database::{SqliteBackend, SqliteOptions};
use ephemera_models::errors::{RuntimeError, SendableError};
use ephemera_utilities::startup;
use log::{error, info, warn};

use crate::jobs::SessionJob;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Ephemera Worker", &config.log_file, &config.log_level)?;

    let backend = build_backend(&config).await?;
    let queue: Arc<Queue<SessionJob>> = Arc::new(
        Queue::builder()
            .shared_backend(backend)
            .jobs(jobs::session_jobs())
            .generator(UuidGenerator)
            .build()?,
    );
    info!("Registered jobs: {:?}", queue);

    let ctx = CancellationToken::new();
    let consumer = Consumer::new(queue.clone())
        .with_workers(config.workers)
        .start(&ctx);

    let intake_ctx = ctx.child_token();
    let intake_task = tokio::spawn(intake::run_intake(
        intake::spawn_stdin_reader()?,
        queue.clone(),
        intake_ctx.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Stopping worker...");

    intake_ctx.cancel();
    match intake_task.await {
        Ok(accepted) => info!("Intake stopped after accepting {} task(s)", accepted),
        Err(err) => error!("Intake task join error: {}", err),
    }

    if let Err(err) = queue.force_flush(&ctx).await {
        error!("Failed to flush buffered tasks: {}", err);
    }

    let stopped = consumer.shutdown(config.shutdown_timeout).await;
    ctx.cancel();
    queue.close().await?;

    match stopped {
        Ok(()) => {
            info!("Worker stopped");
            Ok(())
        }
        Err(QueueError::ShutdownTimeout(timeout)) => {
            warn!(
                "Handlers still running after {:?}; their tasks stay in flight",
                timeout
            );
            Ok(())
        }
        Err(err) => Err(Box::new(err) as SendableError),
    }
}

async fn build_backend(config: &Config) -> Result<Arc<dyn Backend>, SendableError> {
    match config.backend {
        BackendKind::Memory => {
            info!("Using in-memory queue; tasks do not survive a restart");
            Ok(Arc::new(InMemoryBackend::with_options(InMemoryOptions {
                batch: config.batch,
                retry: config.retry_policy(),
            })))
        }
        BackendKind::Sqlite => {
            let options = SqliteOptions {
                queue_name: config.queue_name.clone(),
                batch: config.batch,
                retry: config.retry_policy(),
                poll_interval: config.poll_interval,
            };
            let backend = SqliteBackend::open(&config.database, options)
                .await
                .map_err(|err| backend_error("open", err))?;
            let recovered = backend
                .requeue_in_flight()
                .await
                .map_err(|err| backend_error("recover", err))?;
            if recovered > 0 {
                info!("Recovered {} task(s) from a previous run", recovered);
            }
            Ok(Arc::new(backend))
        }
    }
}

fn backend_error(context: &'static str, err: QueueError) -> SendableError {
    Box::new(RuntimeError::new(
        format!("worker.backend.{context}"),
        err.to_string(),
    ))
}
