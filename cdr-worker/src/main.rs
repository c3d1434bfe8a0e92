//! Forward the call-detail records of the current billing day to the collector, then exit.
use envconfig::Envconfig;
use tracing::error;

use cdr_worker::config::Config;
use cdr_worker::error::WorkerError;
use cdr_worker::logging;
use cdr_worker::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let config = Config::init_from_env()?;
    let _log_guard = logging::init(&config.log_dir)?;

    let scheduler = Scheduler::new(&config)?;

    if let Err(e) = scheduler.run().await {
        error!("worker run failed: {}", e);
        return Err(e);
    }

    Ok(())
}
