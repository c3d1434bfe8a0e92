use std::path::PathBuf;
use std::sync::Arc;
use std::time;

use cdr_common::checkpoint::Checkpoint;
use cdr_common::retry::RetryPolicy;
use cdr_common::retry_store::RetryStore;
use chrono::{Duration, Local, NaiveDate};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::tailer::Tailer;
use crate::worker::{DeliveryWorker, HttpCollector};

/// Base of the quadratic backoff between redeliveries of the same entry.
const BACKOFF_BASE_SECONDS: i64 = 53;

/// Runs a single pass of the worker: replay pending deliveries, read the current billing day,
/// roll over to the next day if it is over, then wait for deliveries and save what is left.
pub struct Scheduler {
    bil_path: String,
    checkpoint_path: PathBuf,
    retry_store_path: PathBuf,
    drain_timeout: time::Duration,
    retry_store: RetryStore,
    worker: DeliveryWorker,
}

impl Scheduler {
    pub fn new(config: &Config) -> Result<Self, WorkerError> {
        let collector = HttpCollector::new(
            &config.upload_url,
            &config.access_token,
            &config.signing_salt,
            config.request_timeout.0,
        )?;

        let retry_store = RetryStore::new();
        let retry_policy =
            RetryPolicy::new(config.max_retry, Duration::seconds(BACKOFF_BASE_SECONDS));
        let worker = DeliveryWorker::new(
            Arc::new(collector),
            retry_store.clone(),
            retry_policy,
            config.upload_concurrency.get(),
        );

        Ok(Self {
            bil_path: config.bil_path.clone(),
            checkpoint_path: config.checkpoint_path.clone(),
            retry_store_path: config.retry_store_path.clone(),
            drain_timeout: config.drain_timeout(),
            retry_store,
            worker,
        })
    }

    pub async fn run(&self) -> Result<Checkpoint, WorkerError> {
        self.run_at(Local::now().date_naive()).await
    }

    /// Run a pass as if the local date were `today`, returning the final checkpoint.
    ///
    /// Once the checkpoint has been loaded, deliveries are drained and the retry store is saved
    /// even if reading a source file fails.
    pub async fn run_at(&self, today: NaiveDate) -> Result<Checkpoint, WorkerError> {
        let mut checkpoint = Checkpoint::load(&self.checkpoint_path).await?;

        match self.retry_store.load(&self.retry_store_path).await {
            Ok(loaded) => info!("loaded {} pending deliveries", loaded),
            Err(e) => error!("starting without pending deliveries: {}", e),
        }

        info!(
            billing_date = %checkpoint.billing_date,
            record_index = checkpoint.record_index,
            "replaying pending deliveries"
        );
        self.worker.replay(self.retry_store.remove_and_return_all());

        let result = self.process_days(&mut checkpoint, today).await;
        if let Err(e) = &result {
            error!(
                billing_date = %checkpoint.billing_date,
                record_index = checkpoint.record_index,
                "failed to process records: {}", e
            );
        }

        if !self.worker.drain(self.drain_timeout).await {
            warn!(
                in_flight = self.worker.in_flight(),
                "timed out waiting for deliveries, unfinished ones may be lost"
            );
        }
        let pending = self.retry_store.persist(&self.retry_store_path).await?;

        info!(
            billing_date = %checkpoint.billing_date,
            record_index = checkpoint.record_index,
            pending,
            "closing"
        );

        result.map(|_| checkpoint)
    }

    async fn process_days(
        &self,
        checkpoint: &mut Checkpoint,
        today: NaiveDate,
    ) -> Result<(), WorkerError> {
        let tailer = Tailer::new(&self.worker, &self.checkpoint_path);

        info!(
            billing_date = %checkpoint.billing_date,
            record_index = checkpoint.record_index,
            "processing current day"
        );
        let source = checkpoint.source_path(&self.bil_path);
        tailer.process_pass(checkpoint, &source).await?;

        if checkpoint.roll_over(today) {
            info!(
                billing_date = %checkpoint.billing_date,
                record_index = checkpoint.record_index,
                "processing next day"
            );
            let source = checkpoint.source_path(&self.bil_path);
            tailer.process_pass(checkpoint, &source).await?;
        }

        Ok(())
    }
}
