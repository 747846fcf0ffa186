//! Event outbox and delivery worker.
//!
//! Flows that create sessions or users enqueue a row in `jobs` inside the same
//! transaction as the write that caused it, so an event exists if and only if
//! its cause was committed. A background task polls pending rows, locks a
//! batch, and hands each job to an [`EventSink`]. Failed deliveries are
//! retried with exponential backoff and jitter until `max_attempts`, then the
//! row is marked `failed`.
//!
//! The default sink logs the event. [`WebhookEventSink`] posts it as JSON.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    APP_USER_AGENT,
    store::{
        Store, StoreResult, StoreTx,
        models::{Job, JobKind, JobStatus},
    },
};

/// Enqueue an event in the caller's transaction.
///
/// # Errors
/// Propagates store failures.
pub async fn enqueue(
    tx: &mut dyn StoreTx,
    instance_id: &str,
    kind: JobKind,
    payload: Value,
    now: DateTime<Utc>,
) -> StoreResult<Job> {
    let job = Job::new(instance_id, kind, payload, now);
    tx.enqueue_job(&job).await?;
    debug!(job_id = %job.id, kind = kind.as_str(), "event enqueued");
    Ok(job)
}

/// Event delivery abstraction used by the job worker.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver a job or return an error to schedule a retry.
    async fn deliver(&self, job: &Job) -> Result<()>;
}

/// Local sink that logs the event instead of delivering it.
#[derive(Clone, Debug)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn deliver(&self, job: &Job) -> Result<()> {
        info!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            payload = %job.payload,
            "event delivered to log sink"
        );
        Ok(())
    }
}

/// Posts each event to a webhook endpoint.
pub struct WebhookEventSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookEventSink {
    /// # Errors
    /// Returns an error if the http client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl EventSink for WebhookEventSink {
    async fn deliver(&self, job: &Job) -> Result<()> {
        let body = json!({
            "id": job.id,
            "type": job.kind.as_str(),
            "instance_id": job.instance_id,
            "data": job.payload,
            "created_at": job.created_at,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("failed to post webhook")?;
        if !response.status().is_success() {
            return Err(anyhow!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

/// Sink that records delivered jobs, for tests and embedding.
#[derive(Default)]
pub struct MemoryEventSink {
    delivered: Mutex<Vec<Job>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delivered(&self) -> Vec<Job> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn deliver(&self, job: &Job) -> Result<()> {
        self.delivered.lock().await.push(job.clone());
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct JobWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl JobWorkerConfig {
    /// Default worker config: 5s poll interval, 10 jobs per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        Self {
            poll_interval,
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            backoff_base,
            backoff_max: self.backoff_max.max(backoff_base),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that polls and delivers pending jobs.
pub fn spawn_job_worker(
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    config: JobWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();
        let poll_interval = config.poll_interval();

        loop {
            if let Err(err) = process_job_batch(store.as_ref(), sink.as_ref(), &config).await {
                error!("job batch failed: {err:#}");
            }

            sleep(poll_interval).await;
        }
    })
}

/// Deliver one batch of due jobs. Returns how many were picked up.
///
/// # Errors
/// Returns an error if the batch cannot be loaded or its updates committed.
pub async fn process_job_batch(
    store: &dyn Store,
    sink: &dyn EventSink,
    config: &JobWorkerConfig,
) -> Result<usize> {
    let mut tx = store
        .begin()
        .await
        .context("failed to start job transaction")?;

    let now = Utc::now();
    let jobs = tx
        .pending_jobs(config.batch_size(), now)
        .await
        .context("failed to load job batch")?;

    if jobs.is_empty() {
        // Commit even on empty to release locks.
        tx.commit().await.context("failed to commit empty job batch")?;
        return Ok(0);
    }

    let count = jobs.len();
    for mut job in jobs {
        let result = sink.deliver(&job).await;
        apply_delivery_result(&mut job, result, config, now);
        tx.save_job(&job).await.context("failed to update job status")?;
    }

    tx.commit().await.context("failed to commit job batch")?;

    Ok(count)
}

fn apply_delivery_result(
    job: &mut Job,
    result: Result<()>,
    config: &JobWorkerConfig,
    now: DateTime<Utc>,
) {
    let next_attempt = u32::try_from(job.attempts).unwrap_or(0).saturating_add(1);
    job.attempts = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match result {
        Ok(()) => {
            job.status = JobStatus::Sent;
            job.last_error = None;
            job.next_attempt_at = now;
        }
        Err(err) if next_attempt >= config.max_attempts() => {
            warn!(job_id = %job.id, "job failed permanently: {err:#}");
            job.status = JobStatus::Failed;
            job.last_error = Some(err.to_string());
            job.next_attempt_at = now;
        }
        Err(err) => {
            let delay = backoff_delay(next_attempt, config.backoff_base(), config.backoff_max());
            job.status = JobStatus::Pending;
            job.last_error = Some(err.to_string());
            job.next_attempt_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
