//! Background job worker.
//!
//! Three loops share one worker:
//! - **poll**: fetch pending jobs on an interval into a bounded queue (overflow dropped)
//! - **consume**: run queued jobs one at a time through the dispatcher
//! - **heartbeat**: report worker status on an interval
//!
//! Stop is cooperative. Loops exit after their current unit of work, and an
//! in-flight module call is allowed to finish.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::Credentials;
use crate::bridge::protocol::ProgressEvent;
use crate::dispatch::Dispatcher;
use crate::job::Job;
use crate::status::{JobSource, StatusError, StatusSink, WorkerStatus};

/// Target for job lifecycle events.
pub const JOB_LOG_TARGET: &str = "converso::job";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    /// Progress events buffered between a running job and the status relay.
    pub progress_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5 * 60),
            queue_capacity: 100,
            progress_buffer: 100,
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker already started")]
    AlreadyStarted,
    #[error("worker is not running")]
    NotRunning,
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyStarted => "WORKER_ALREADY_STARTED",
            Self::NotRunning => "WORKER_NOT_RUNNING",
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    dispatcher: Arc<Dispatcher>,
    source: Arc<dyn JobSource>,
    sink: Arc<dyn StatusSink>,
    credentials: Credentials,
    /// Snapshots of queued and running jobs.
    jobs: DashMap<String, Job>,
    queue_tx: mpsc::Sender<Job>,
    queue_rx: StdMutex<Option<mpsc::Receiver<Job>>>,
    stop: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        dispatcher: Arc<Dispatcher>,
        source: Arc<dyn JobSource>,
        sink: Arc<dyn StatusSink>,
        credentials: Credentials,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            config,
            dispatcher,
            source,
            sink,
            credentials,
            jobs: DashMap::new(),
            queue_tx,
            queue_rx: StdMutex::new(Some(queue_rx)),
            stop: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn the worker loops. A worker runs at most once.
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        let rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WorkerError::AlreadyStarted)?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(self.clone().poll_loop()));
        tasks.push(tokio::spawn(self.clone().consume_loop(rx)));
        tasks.push(tokio::spawn(self.clone().heartbeat_loop()));

        tracing::info!(
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            queue_capacity = self.config.queue_capacity,
            "Worker started"
        );
        Ok(())
    }

    /// Signal the loops to stop and wait for them.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return Err(WorkerError::NotRunning);
        }
        tracing::info!("Stopping worker");
        self.stop.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
        tracing::info!("Worker stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
            && !self
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_tx.max_capacity() - self.queue_tx.capacity()
    }

    /// Latest snapshot of a queued or running job.
    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Queue a job without waiting. Returns false if it was dropped
    /// (queue full, or the job is already known).
    pub fn enqueue(&self, job: Job) -> bool {
        let job_id = job.id.clone();
        if self.jobs.contains_key(&job_id) {
            tracing::debug!(target: JOB_LOG_TARGET, job_id = %job_id, "Job already queued, skipping");
            return false;
        }
        self.jobs.insert(job_id.clone(), job.clone());
        match self.queue_tx.try_send(job) {
            Ok(()) => {
                tracing::info!(target: JOB_LOG_TARGET, job_id = %job_id, "Job added to queue");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.jobs.remove(&job_id);
                tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, "Job queue full, skipping job");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.jobs.remove(&job_id);
                tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, "Job queue closed, skipping job");
                false
            }
        }
    }

    /// Fetch pending jobs once and queue them. Returns how many were queued.
    pub async fn poll_once(&self) -> Result<usize, StatusError> {
        if self.credentials.is_expired() {
            return Err(StatusError::Unauthenticated);
        }
        let jobs = self.source.fetch_pending().await?;
        let fetched = jobs.len();
        let mut queued = 0;
        for job in jobs {
            if self.stop.is_cancelled() {
                break;
            }
            if self.enqueue(job) {
                queued += 1;
            }
        }
        tracing::debug!(fetched, queued, "Polled pending jobs");
        Ok(queued)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(code = e.code(), error = %e, "Failed to fetch jobs");
                    }
                }
            }
        }
    }

    async fn consume_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Job>) {
        loop {
            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                job = rx.recv() => job,
            };
            match job {
                Some(job) => self.process(job).await,
                None => break,
            }
        }

        // Queued jobs stay pending on the server; forget them locally.
        rx.close();
        while let Ok(job) = rx.try_recv() {
            tracing::info!(target: JOB_LOG_TARGET, job_id = %job.id, "Dropping queued job on stop");
            self.jobs.remove(&job.id);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    let status = WorkerStatus::running(self.queue_size());
                    if let Err(e) = self.sink.report_worker(&status).await {
                        tracing::warn!(error = %e, "Failed to report worker status");
                    }
                }
            }
        }
    }

    /// Run one job to a terminal state and report it.
    async fn process(&self, mut job: Job) {
        let job_id = job.id.clone();

        if job.is_expired_at(Utc::now()) {
            tracing::info!(target: JOB_LOG_TARGET, job_id = %job_id, "Job expired before it could run");
            match job.cancel("job expired") {
                Ok(()) => self.report_final(&job).await,
                Err(e) => tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, error = %e, "Cannot cancel job"),
            }
            self.jobs.remove(&job_id);
            return;
        }

        if let Err(e) = job.start() {
            tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, error = %e, "Cannot start job");
            self.jobs.remove(&job_id);
            return;
        }
        self.jobs.insert(job_id.clone(), job.clone());
        tracing::info!(
            target: JOB_LOG_TARGET,
            job_id = %job_id,
            module = %job.module,
            command = %job.command,
            "Processing job"
        );
        if let Err(e) = self.sink.report_status(&job).await {
            tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, error = %e, "Failed to report job start");
        }

        let (progress_tx, progress_rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let run = self.dispatcher.execute_with_progress(
            &job.module,
            &job.command,
            job.args.clone(),
            progress_tx,
        );
        // The relay ends once the call drops its sender.
        let (result, ()) = tokio::join!(run, self.relay_progress(&job_id, progress_rx));

        if let Some(snapshot) = self.jobs.get(&job_id) {
            job.progress = snapshot.progress.clone();
        }
        let transition = match result {
            Ok(response) => job.finish(response),
            Err(e) => {
                tracing::error!(target: JOB_LOG_TARGET, job_id = %job_id, code = e.code(), error = %e, "Job failed");
                job.fail(e.to_string())
            }
        };
        if let Err(e) = transition {
            tracing::warn!(target: JOB_LOG_TARGET, job_id = %job_id, error = %e, "Unexpected job state");
        }

        tracing::info!(target: JOB_LOG_TARGET, job_id = %job_id, status = %job.status, "Job finished");
        self.report_final(&job).await;
        self.jobs.remove(&job_id);
    }

    async fn relay_progress(&self, job_id: &str, mut rx: mpsc::Receiver<ProgressEvent>) {
        while let Some(event) = rx.recv().await {
            if let Some(mut snapshot) = self.jobs.get_mut(job_id)
                && let Err(e) = snapshot.record_progress(event.clone())
            {
                tracing::debug!(target: JOB_LOG_TARGET, job_id, error = %e, "Progress for finished job");
            }
            if let Err(e) = self.sink.report_progress(job_id, &event).await {
                tracing::warn!(target: JOB_LOG_TARGET, job_id, error = %e, "Failed to report job progress");
            }
        }
    }

    async fn report_final(&self, job: &Job) {
        if let Err(e) = self.sink.report_status(job).await {
            tracing::error!(
                target: JOB_LOG_TARGET,
                job_id = %job.id,
                status = %job.status,
                error = %e,
                "Failed to report final job status"
            );
        }
    }
}
