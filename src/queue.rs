//! Component G: partitioned tool-job queue.
//!
//! State machine: `queued -> running -> {completed, queued[retry], failed,
//! dead_letter}`. Jobs carry a `tool` partition and a `qos` class; both
//! `claim_next`'s running-count accounting and `monitor_queue_health`'s
//! thresholds are scoped per job so one noisy tool can't starve the rest of
//! the queue or hide in an aggregate metric.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerting::{ship_best_effort, AlertShipper, NullShipper};
use crate::bulkhead::Bulkhead;
use crate::config::{ToolQueueAlertThresholds, ToolQueueConfig};
use crate::store::AlertStore;
use crate::telemetry::{PolicyEvent, QueueEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

#[derive(Clone, Debug)]
pub struct ToolJob {
    pub id: Uuid,
    pub tool: String,
    pub qos: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Why `enqueue` rejected a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    /// `max_queued_by_tool` reached for this tool partition.
    QueueSaturated,
}

/// Fixed `toolName -> qosClass` mapping (§4.G). QoS is a property of the
/// tool, not something a caller can pick per call.
fn qos_for_tool(tool: &str) -> &'static str {
    match tool {
        "search_web" => "realtime",
        "search_products" => "interactive",
        "search_global" => "batch",
        _ => "batch",
    }
}

pub struct ToolQueue {
    jobs: Arc<Mutex<HashMap<Uuid, ToolJob>>>,
    config: ToolQueueConfig,
    worker_bulkhead: Bulkhead,
    sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>,
}

impl ToolQueue {
    pub fn new(config: ToolQueueConfig, worker_bulkhead: Bulkhead, sink: Arc<dyn Fn(PolicyEvent) + Send + Sync>) -> Self {
        Self { jobs: Arc::new(Mutex::new(HashMap::new())), config, worker_bulkhead, sink }
    }

    pub fn in_memory(config: ToolQueueConfig) -> Self {
        let bulkhead = Bulkhead::new("tool_job_worker", config.max_per_run, Duration::from_millis(config.lease_ms));
        Self::new(config, bulkhead, Arc::new(|_event| {}))
    }

    /// `enqueue(tool, payload)`. The job's qos class is derived from `tool`
    /// via the fixed `qos_for_tool` mapping, never supplied by the caller.
    pub fn enqueue(&self, tool: &str, payload: serde_json::Value, now: DateTime<Utc>) -> Result<Uuid, EnqueueError> {
        let mut jobs = self.jobs.lock().unwrap();
        let queued_for_tool = jobs.values().filter(|j| j.tool == tool && j.status == JobStatus::Queued).count() as u64;
        if queued_for_tool >= self.config.max_queued_by_tool {
            return Err(EnqueueError::QueueSaturated);
        }

        let qos = qos_for_tool(tool);
        let id = Uuid::new_v4();
        jobs.insert(
            id,
            ToolJob {
                id,
                tool: tool.to_string(),
                qos: qos.to_string(),
                payload,
                status: JobStatus::Queued,
                attempts: 0,
                enqueued_at: now,
                next_attempt_at: now,
                lease_expires_at: None,
                last_error: None,
            },
        );
        drop(jobs);
        (self.sink)(PolicyEvent::Queue(QueueEvent::Enqueued { job_id: id.to_string(), tool: tool.to_string(), qos: qos.to_string() }));
        Ok(id)
    }

    /// `claimNext`: requeue stale leases, compute running counts per
    /// partition, then pick the oldest eligible candidate whose tool and
    /// qos are both under their running cap. Round-robins fairness by
    /// always picking the globally-oldest *eligible* candidate rather than
    /// draining one tool's backlog before considering another's.
    pub fn claim_next(&self, now: DateTime<Utc>) -> Option<ToolJob> {
        let mut jobs = self.jobs.lock().unwrap();

        let stale: Vec<Uuid> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.lease_expires_at.is_some_and(|exp| exp <= now))
            .map(|j| j.id)
            .collect();
        for id in &stale {
            if let Some(job) = jobs.get_mut(id) {
                job.status = JobStatus::Queued;
                job.lease_expires_at = None;
                (self.sink)(PolicyEvent::Queue(QueueEvent::Requeued { job_id: job.id.to_string(), tool: job.tool.clone() }));
            }
        }

        let mut running_by_tool: HashMap<String, u64> = HashMap::new();
        let mut running_by_qos: HashMap<String, u64> = HashMap::new();
        for job in jobs.values().filter(|j| j.status == JobStatus::Running) {
            *running_by_tool.entry(job.tool.clone()).or_default() += 1;
            *running_by_qos.entry(job.qos.clone()).or_default() += 1;
        }

        let picked_id = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.next_attempt_at <= now)
            .filter(|j| *running_by_tool.get(&j.tool).unwrap_or(&0) < self.config.running_cap_by_tool)
            .filter(|j| *running_by_qos.get(&j.qos).unwrap_or(&0) < self.config.running_cap_by_qos)
            .take(self.config.claim_scan_size)
            .min_by_key(|j| j.enqueued_at)
            .map(|j| j.id)?;

        let job = jobs.get_mut(&picked_id)?;
        job.status = JobStatus::Running;
        job.attempts += 1;
        job.lease_expires_at = Some(now + chrono::Duration::milliseconds(self.config.lease_ms as i64));
        let result = job.clone();
        drop(jobs);
        (self.sink)(PolicyEvent::Queue(QueueEvent::Claimed { job_id: result.id.to_string(), tool: result.tool.clone(), attempt: result.attempts }));
        Some(result)
    }

    /// `complete(jobId)`.
    pub fn complete(&self, job_id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
            job.lease_expires_at = None;
            let tool = job.tool.clone();
            drop(jobs);
            (self.sink)(PolicyEvent::Queue(QueueEvent::Completed { job_id: job_id.to_string(), tool }));
        }
    }

    /// `fail(jobId, error)`: retries with `retryDelayMs = min(retry_base_ms
    /// * 2^(attempts-1), 60_000)` until `max_attempts`, then dead-letters.
    pub fn fail(&self, job_id: Uuid, error: impl Into<String>, now: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else { return };
        let error = error.into();
        job.last_error = Some(error);
        job.lease_expires_at = None;

        if job.attempts < self.config.max_attempts {
            let exponent = job.attempts.saturating_sub(1).min(32);
            let multiplier = 1u64 << exponent;
            let retry_delay_ms = self.config.retry_base_ms.saturating_mul(multiplier).min(60_000);
            job.status = JobStatus::Queued;
            job.next_attempt_at = now + chrono::Duration::milliseconds(retry_delay_ms as i64);
            let (job_id_s, tool, attempt) = (job.id.to_string(), job.tool.clone(), job.attempts);
            drop(jobs);
            (self.sink)(PolicyEvent::Queue(QueueEvent::Failed { job_id: job_id_s, tool, attempt, will_retry: true }));
        } else {
            job.status = JobStatus::DeadLetter;
            let (job_id_s, tool, attempts) = (job.id.to_string(), job.tool.clone(), job.attempts);
            drop(jobs);
            (self.sink)(PolicyEvent::Queue(QueueEvent::Failed { job_id: job_id_s.clone(), tool: tool.clone(), attempt: attempts, will_retry: false }));
            (self.sink)(PolicyEvent::Queue(QueueEvent::DeadLettered { job_id: job_id_s, tool, attempts }));
        }
    }

    /// `requeueDeadLetter(jobId)`: manual operator recovery, resets attempts.
    pub fn requeue_dead_letter(&self, job_id: Uuid, now: DateTime<Utc>) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else { return false };
        if job.status != JobStatus::DeadLetter {
            return false;
        }
        job.status = JobStatus::Queued;
        job.attempts = 0;
        job.next_attempt_at = now;
        job.last_error = None;
        let tool = job.tool.clone();
        drop(jobs);
        (self.sink)(PolicyEvent::Queue(QueueEvent::Requeued { job_id: job_id.to_string(), tool }));
        true
    }

    pub fn get(&self, job_id: Uuid) -> Option<ToolJob> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    /// Count of jobs currently in `status`, for the reliability snapshot.
    pub fn count(&self, status: JobStatus) -> u64 {
        self.jobs.lock().unwrap().values().filter(|j| j.status == status).count() as u64
    }

    /// `processQueue`: claim and run one job behind the worker bulkhead.
    /// Returns `false` if there was nothing eligible to claim.
    pub async fn process_one<F, Fut>(&self, handler: F, now: DateTime<Utc>) -> bool
    where
        F: FnOnce(ToolJob) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let guard = match self.worker_bulkhead.acquire_slot(&|_event| {}) {
            Ok(guard) => guard,
            Err(_) => return false,
        };

        let Some(job) = self.claim_next(now) else {
            return false;
        };

        match handler(job.clone()).await {
            Ok(()) => self.complete(job.id),
            Err(err) => self.fail(job.id, err, now),
        }
        drop(guard);
        true
    }

    /// Sweep terminal jobs past their retention window.
    pub fn cleanup_retention(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| match job.status {
            JobStatus::Completed => now - job.enqueued_at < chrono::Duration::milliseconds(self.config.retention_ms as i64),
            JobStatus::DeadLetter => now - job.enqueued_at < chrono::Duration::milliseconds(self.config.dead_letter_retention_ms as i64),
            _ => true,
        });
        before - jobs.len()
    }

    /// `monitorQueueHealth`: evaluate the four depth/age thresholds,
    /// deduping each alert by its own cooldown window.
    pub async fn monitor_queue_health(
        &self,
        thresholds: &ToolQueueAlertThresholds,
        alerts: &dyn AlertStore,
        shipper: &dyn AlertShipper,
        now: DateTime<Utc>,
    ) {
        let jobs = self.jobs.lock().unwrap();
        let queued_depth = jobs.values().filter(|j| j.status == JobStatus::Queued).count() as u64;
        let dead_letter_depth = jobs.values().filter(|j| j.status == JobStatus::DeadLetter).count() as u64;
        let oldest_queued_age_minutes = jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .map(|j| (now - j.enqueued_at).num_minutes().max(0) as u64)
            .max()
            .unwrap_or(0);
        let oldest_running_age_minutes = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| (now - j.enqueued_at).num_minutes().max(0) as u64)
            .max()
            .unwrap_or(0);
        drop(jobs);

        let cooldown = Duration::from_secs(thresholds.window_minutes * 60);
        let checks: [(&str, u64, u64); 4] = [
            ("queue_depth", queued_depth, thresholds.queued_depth),
            ("oldest_queued_age", oldest_queued_age_minutes, thresholds.oldest_queued_age_minutes),
            ("oldest_running_age", oldest_running_age_minutes, thresholds.oldest_running_age_minutes),
            ("dead_letter_depth", dead_letter_depth, thresholds.dead_letter_depth),
        ];

        for (name, value, threshold) in checks {
            if value < threshold {
                continue;
            }
            let alert_key = format!("tool_queue:{name}");
            match alerts.try_fire(&alert_key, cooldown, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, name, "alert store unavailable, skipping dedupe");
                }
            }
            (self.sink)(PolicyEvent::Queue(QueueEvent::HealthAlert { alert: name.to_string(), value, threshold }));
            let payload = serde_json::json!({
                "message": format!("tool queue health alert: {name} = {value} (threshold {threshold})"),
                "level": "warning",
                "extra": { "alert": name, "value": value, "threshold": threshold },
            });
            ship_best_effort(shipper, Uuid::new_v4(), now, &payload).await;
        }
    }
}

/// Outcome of `enqueue_tool_job_and_wait`.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Completed(serde_json::Value),
    Saturated,
    Timeout,
    DeadLettered(Option<String>),
}

impl ToolQueue {
    /// `enqueueToolJobAndWait`: client-facing convenience wrapper that
    /// enqueues, then polls at `poll_ms` up to `wait_ms` before giving up.
    /// `result_of` supplies the completed job's result payload (the queue
    /// itself has no notion of a return value beyond success/failure).
    pub async fn enqueue_tool_job_and_wait(
        &self,
        tool: &str,
        payload: serde_json::Value,
        result_of: impl Fn(Uuid) -> Option<serde_json::Value>,
    ) -> WaitOutcome {
        let now = Utc::now();
        let job_id = match self.enqueue(tool, payload, now) {
            Ok(id) => id,
            Err(EnqueueError::QueueSaturated) => return WaitOutcome::Saturated,
        };

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.wait_ms);
        let poll_interval = Duration::from_millis(self.config.poll_ms.max(1));

        loop {
            if let Some(job) = self.get(job_id) {
                match job.status {
                    JobStatus::Completed => return WaitOutcome::Completed(result_of(job_id).unwrap_or(serde_json::Value::Null)),
                    JobStatus::DeadLetter => return WaitOutcome::DeadLettered(job.last_error),
                    _ => {}
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return WaitOutcome::Timeout;
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ToolQueueConfig {
        ToolQueueConfig {
            max_per_run: 4,
            lease_ms: 30_000,
            wait_ms: 200,
            poll_ms: 10,
            max_attempts: 3,
            retry_base_ms: 100,
            retention_ms: 3_600_000,
            dead_letter_retention_ms: 86_400_000,
            claim_scan_size: 100,
            max_queued_by_tool: 2,
            running_cap_by_tool: 10,
            running_cap_by_qos: 10,
        }
    }

    #[test]
    fn enqueue_rejects_once_max_queued_by_tool_is_reached() {
        let queue = ToolQueue::in_memory(test_config());
        let now = Utc::now();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        let third = queue.enqueue("search_web", serde_json::json!({}), now);
        assert_eq!(third, Err(EnqueueError::QueueSaturated));
    }

    #[test]
    fn claim_next_picks_the_oldest_eligible_job() {
        let queue = ToolQueue::in_memory(test_config());
        let t0 = Utc::now();
        let first = queue.enqueue("search_web", serde_json::json!({"n": 1}), t0).unwrap();
        queue.enqueue("search_web", serde_json::json!({"n": 2}), t0 + chrono::Duration::seconds(1)).unwrap();

        let claimed = queue.claim_next(t0 + chrono::Duration::seconds(2)).unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.attempts, 1);
    }

    #[test]
    fn claim_next_respects_running_cap_by_tool() {
        let mut config = test_config();
        config.running_cap_by_tool = 1;
        config.max_queued_by_tool = 10;
        let queue = ToolQueue::in_memory(config);
        let now = Utc::now();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();

        assert!(queue.claim_next(now).is_some());
        assert!(queue.claim_next(now).is_none(), "second job for the same tool must wait for the running cap");
    }

    #[test]
    fn stale_lease_is_requeued_on_claim_next() {
        let mut config = test_config();
        config.lease_ms = 1_000;
        let queue = ToolQueue::in_memory(config);
        let now = Utc::now();
        let job_id = queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        queue.claim_next(now).unwrap();

        let later = now + chrono::Duration::seconds(2);
        let reclaimed = queue.claim_next(later).unwrap();
        assert_eq!(reclaimed.id, job_id);
        assert_eq!(reclaimed.attempts, 2, "the stale-lease requeue should not double-increment before the re-claim");
    }

    #[test]
    fn fail_retries_with_doubling_backoff_then_dead_letters() {
        let queue = ToolQueue::in_memory(test_config());
        let now = Utc::now();
        let job_id = queue.enqueue("search_web", serde_json::json!({}), now).unwrap();

        queue.claim_next(now).unwrap();
        queue.fail(job_id, "boom", now);
        let job = queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.next_attempt_at, now + chrono::Duration::milliseconds(100));

        let retry_time = now + chrono::Duration::milliseconds(101);
        queue.claim_next(retry_time).unwrap();
        queue.fail(job_id, "boom again", retry_time);
        let job = queue.get(job_id).unwrap();
        assert_eq!(job.next_attempt_at, retry_time + chrono::Duration::milliseconds(200));

        let third_attempt = retry_time + chrono::Duration::milliseconds(201);
        queue.claim_next(third_attempt).unwrap();
        queue.fail(job_id, "boom a third time", third_attempt);
        let job = queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::DeadLetter);
    }

    #[test]
    fn requeue_dead_letter_resets_attempts() {
        let mut config = test_config();
        config.max_attempts = 1;
        let queue = ToolQueue::in_memory(config);
        let now = Utc::now();
        let job_id = queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        queue.claim_next(now).unwrap();
        queue.fail(job_id, "boom", now);
        assert_eq!(queue.get(job_id).unwrap().status, JobStatus::DeadLetter);

        assert!(queue.requeue_dead_letter(job_id, now));
        let job = queue.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn process_one_completes_a_job_via_the_handler() {
        let queue = ToolQueue::in_memory(test_config());
        let now = Utc::now();
        let job_id = queue.enqueue("search_web", serde_json::json!({}), now).unwrap();

        let did_work = queue.process_one(|_job| async { Ok(()) }, now).await;
        assert!(did_work);
        assert_eq!(queue.get(job_id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn enqueue_tool_job_and_wait_times_out_if_never_claimed() {
        let mut config = test_config();
        config.wait_ms = 50;
        config.poll_ms = 10;
        let queue = ToolQueue::in_memory(config);
        let outcome = queue.enqueue_tool_job_and_wait("search_web", serde_json::json!({}), |_| None).await;
        assert_eq!(outcome, WaitOutcome::Timeout);
    }

    #[tokio::test]
    async fn monitor_queue_health_fires_once_per_cooldown() {
        let queue = ToolQueue::in_memory(test_config());
        let now = Utc::now();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();
        queue.enqueue("search_web", serde_json::json!({}), now).unwrap();

        let thresholds = ToolQueueAlertThresholds {
            queued_depth: 2,
            oldest_queued_age_minutes: 1_000,
            oldest_running_age_minutes: 1_000,
            dead_letter_depth: 1_000,
            window_minutes: 5,
        };
        let alerts = crate::store::InMemoryAlertStore::default();
        let shipper = NullShipper::new();
        queue.monitor_queue_health(&thresholds, &alerts, &shipper, now).await;
        queue.monitor_queue_health(&thresholds, &alerts, &shipper, now + chrono::Duration::seconds(1)).await;

        assert_eq!(shipper.sent().len(), 1);
    }
}
