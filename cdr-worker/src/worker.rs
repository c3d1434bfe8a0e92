use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use cdr_common::record::Event;
use cdr_common::retry::{content_key, RetryDecision, RetryEntry, RetryPolicy};
use cdr_common::retry_store::RetryStore;
use cdr_common::signing::sign_request;
use chrono::Utc;
use http::StatusCode;
use reqwest::{header, Client};
use tokio::sync;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::error::DeliveryError;

pub const ACCESS_TOKEN_HEADER: &str = "accessToken";
pub const TIMESTAMP_HEADER: &str = "no";
pub const SIGNATURE_HEADER: &str = "bug";

/// The collector answers 200 even for some failures, flagging them with this text in the body.
const FAILURE_SENTINEL: &str = "500";

/// Anything able to accept a serialized `RetryEntry`.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn deliver(&self, payload: Vec<u8>) -> Result<(), DeliveryError>;
}

pub fn build_http_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("CDR Worker")
        .timeout(request_timeout)
        .build()
}

/// The remote collector, reached over signed HTTP POST requests.
pub struct HttpCollector {
    client: Client,
    url: String,
    access_token: String,
    signing_salt: String,
}

impl HttpCollector {
    pub fn new(
        url: &str,
        access_token: &str,
        signing_salt: &str,
        request_timeout: time::Duration,
    ) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
            url: url.to_owned(),
            access_token: access_token.to_owned(),
            signing_salt: signing_salt.to_owned(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    /// Send `payload` and check the collector accepted it: a 200 status without the failure
    /// sentinel anywhere in the body.
    async fn deliver(&self, payload: Vec<u8>) -> Result<(), DeliveryError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = sign_request(&timestamp, &self.signing_salt, &self.access_token);

        let response = self
            .client
            .post(self.url.as_str())
            .header(ACCESS_TOKEN_HEADER, self.access_token.as_str())
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != StatusCode::OK {
            return Err(DeliveryError::StatusError { status, body });
        }
        if body.contains(FAILURE_SENTINEL) {
            return Err(DeliveryError::FailureSentinelError(body));
        }

        Ok(())
    }
}

/// How a single pass of an entry through `process_delivery` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Retried,
    Skipped,
    Dropped,
}

/// Spawns deliveries to a `Collector`, holding at most `max_concurrent_deliveries` in flight.
///
/// Waiting for a free slot happens on the caller's task, which is what slows the reader down
/// when the collector cannot keep up.
#[derive(Clone)]
pub struct DeliveryWorker {
    /// Where payloads are sent.
    collector: Arc<dyn Collector>,
    /// Entries that failed and should be attempted again.
    retry_store: RetryStore,
    /// Decides whether an entry is due, backing off or exhausted.
    retry_policy: RetryPolicy,
    /// One permit per delivery slot.
    semaphore: Arc<sync::Semaphore>,
    max_concurrent_deliveries: usize,
    /// Every spawned delivery, so they can be waited on at shutdown.
    tasks: TaskTracker,
    /// Tasks replaying entries from an earlier run.
    replays: TaskTracker,
    /// Cancelled when draining gives up, so replays put back what they have not dispatched.
    shutdown: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        collector: Arc<dyn Collector>,
        retry_store: RetryStore,
        retry_policy: RetryPolicy,
        max_concurrent_deliveries: usize,
    ) -> Self {
        Self {
            collector,
            retry_store,
            retry_policy,
            semaphore: Arc::new(sync::Semaphore::new(max_concurrent_deliveries)),
            max_concurrent_deliveries,
            tasks: TaskTracker::new(),
            replays: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Deliver a newly decoded event.
    pub async fn submit(&self, event: Event) {
        self.dispatch(RetryEntry::new(event, Utc::now())).await
    }

    /// Deliver an entry left over from an earlier failure, unless it is still backing off.
    pub async fn retry_if_due(&self, entry: RetryEntry) {
        self.dispatch(entry).await
    }

    /// Dispatch every entry in order from a background task, so that the caller can start
    /// reading new records straight away.
    ///
    /// If `drain` gives up first, the entries not yet dispatched go back to the retry store
    /// unchanged.
    pub fn replay(&self, entries: Vec<RetryEntry>) {
        if entries.is_empty() {
            return;
        }

        let worker = self.clone();
        self.replays.spawn(async move {
            let mut remaining = entries.into_iter();

            while let Some(entry) = remaining.next() {
                let permit = tokio::select! {
                    permit = worker.acquire_slot() => permit,
                    _ = worker.shutdown.cancelled() => {
                        let restored = worker.restore(std::iter::once(entry).chain(remaining));
                        warn!(restored, "stopped replaying pending deliveries at shutdown");
                        return;
                    }
                };
                worker.spawn_delivery(permit, entry);
            }
        });
    }

    /// Number of deliveries currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent_deliveries - self.semaphore.available_permits()
    }

    /// Stop accepting work and wait up to `timeout` for replays and spawned deliveries to finish.
    /// Returns whether everything finished in time.
    ///
    /// On timeout, replays still waiting for a slot are stopped and their entries restored to the
    /// retry store before this returns. Deliveries already running are left behind.
    pub async fn drain(&self, timeout: time::Duration) -> bool {
        self.replays.close();
        self.tasks.close();

        let finished = tokio::time::timeout(timeout, async {
            self.replays.wait().await;
            self.tasks.wait().await;
        })
        .await
        .is_ok();

        if !finished {
            self.shutdown.cancel();
            self.replays.wait().await;
        }

        finished
    }

    /// Wait for a free slot, then spawn a task delivering `entry` which frees the slot on exit.
    async fn dispatch(&self, entry: RetryEntry) {
        let permit = self.acquire_slot().await;
        self.spawn_delivery(permit, entry);
    }

    async fn acquire_slot(&self) -> sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore has been closed")
    }

    fn spawn_delivery(&self, permit: sync::OwnedSemaphorePermit, entry: RetryEntry) {
        metrics::gauge!("cdr_worker_saturation_percent").set(
            1f64 - self.semaphore.available_permits() as f64
                / self.max_concurrent_deliveries as f64,
        );
        metrics::counter!("cdr_deliveries_total").increment(1);

        let collector = self.collector.clone();
        let retry_store = self.retry_store.clone();
        let retry_policy = self.retry_policy.clone();

        self.tasks.spawn(async move {
            process_delivery(collector.as_ref(), &retry_store, &retry_policy, entry).await;
            drop(permit);
        });
    }

    /// Store entries that were never dispatched under their content keys, as they are.
    fn restore(&self, entries: impl Iterator<Item = RetryEntry>) -> usize {
        let mut restored = 0;

        for entry in entries {
            match entry.to_payload() {
                Ok(payload) => {
                    self.retry_store.store(content_key(&payload), entry);
                    restored += 1;
                }
                Err(error) => {
                    error!("failed to serialize pending delivery, dropping it: {}", error)
                }
            }
        }

        restored
    }
}

/// Run one delivery attempt for `entry` and record its result in `retry_store`.
///
/// The entry is stored under the content key of the payload it had on arrival:
/// * unchanged, if it is still within its backoff interval;
/// * with one more failed attempt, if the collector did not accept it.
///
/// It is not stored when delivered, nor when it has run out of attempts.
pub async fn process_delivery(
    collector: &dyn Collector,
    retry_store: &RetryStore,
    retry_policy: &RetryPolicy,
    mut entry: RetryEntry,
) -> DeliveryOutcome {
    let payload = match entry.to_payload() {
        Ok(payload) => payload,
        Err(error) => {
            error!("failed to serialize delivery payload, dropping it: {}", error);
            metrics::counter!("cdr_deliveries_dropped").increment(1);
            return DeliveryOutcome::Dropped;
        }
    };
    let key = content_key(&payload);

    match retry_policy.decide(&entry, Utc::now()) {
        RetryDecision::Drop => {
            error!(
                payload = %String::from_utf8_lossy(&payload),
                "delivery ran out of attempts, dropping it"
            );
            metrics::counter!("cdr_deliveries_dropped").increment(1);
            DeliveryOutcome::Dropped
        }
        RetryDecision::Wait => {
            retry_store.store(key, entry);
            metrics::counter!("cdr_deliveries_skipped_backoff").increment(1);
            DeliveryOutcome::Skipped
        }
        RetryDecision::Attempt => match collector.deliver(payload).await {
            Ok(()) => {
                metrics::counter!("cdr_deliveries_completed").increment(1);
                DeliveryOutcome::Delivered
            }
            Err(error) => {
                warn!(
                    attempt_count = entry.attempt_count,
                    "delivery failed, keeping it for a retry: {}", error
                );
                entry.record_failure(Utc::now());
                retry_store.store(key, entry);
                metrics::counter!("cdr_deliveries_retried").increment(1);
                DeliveryOutcome::Retried
            }
        },
    }
}
