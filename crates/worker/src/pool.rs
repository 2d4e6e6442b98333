//! Bounded-concurrency job executor.
//!
//! [`WorkerPool`] implements the job submission boundary: `submit`
//! registers the task as `pending`, queues it and returns immediately. A
//! single dispatch loop pulls jobs off the queue and runs at most
//! `concurrency` of them at once.

use std::sync::Arc;

use async_trait::async_trait;
use taskrelay_core::channels::ChannelName;
use taskrelay_core::error::CoreError;
use taskrelay_core::jobs::JobQueue;
use taskrelay_core::task::{AnalysisRequest, TaskStatus, TaskSubmitted};
use taskrelay_events::Broker;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::pipeline::AnalysisPipeline;
use crate::reporter::ProgressReporter;
use crate::tracker::StatusTracker;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs allowed to run at the same time.
    pub concurrency: usize,
    /// Jobs allowed to wait in the queue before `submit` waits.
    pub queue_capacity: usize,
    pub channel_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 256,
            channel_prefix: taskrelay_core::channels::DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

struct Job {
    task_id: String,
    channel: ChannelName,
    request: AnalysisRequest,
}

struct JobContext {
    broker: Arc<dyn Broker>,
    tracker: Arc<StatusTracker>,
    pipeline: Arc<dyn AnalysisPipeline>,
}

/// Submission side of the pool. Cheap to share behind an `Arc`.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    tracker: Arc<StatusTracker>,
    channel_prefix: String,
}

impl WorkerPool {
    /// Start the dispatch loop. It runs until `cancel` fires, then waits for
    /// in-flight jobs to observe the cancellation.
    pub fn start(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        tracker: Arc<StatusTracker>,
        pipeline: Arc<dyn AnalysisPipeline>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let context = Arc::new(JobContext {
            broker,
            tracker: Arc::clone(&tracker),
            pipeline,
        });

        let handle = tokio::spawn(dispatch_loop(
            rx,
            context,
            config.concurrency.max(1),
            cancel,
        ));

        let pool = Self {
            jobs: tx,
            tracker,
            channel_prefix: config.channel_prefix,
        };
        (pool, handle)
    }

    /// Submit under a caller-chosen task id.
    pub async fn submit_with_id(
        &self,
        task_id: &str,
        request: AnalysisRequest,
    ) -> Result<TaskSubmitted, CoreError> {
        request.validate()?;
        let channel = ChannelName::for_task(&self.channel_prefix, task_id)?;
        self.tracker.register(task_id).await?;

        let job = Job {
            task_id: task_id.to_string(),
            channel,
            request,
        };
        if self.jobs.send(job).await.is_err() {
            if let Err(e) = self
                .tracker
                .transition(
                    task_id,
                    TaskStatus::Error,
                    Some(serde_json::json!({ "error": "worker pool is shut down" })),
                )
                .await
            {
                tracing::error!(task_id, error = %e, "Failed to record rejected job");
            }
            return Err(CoreError::Internal("worker pool is shut down".into()));
        }

        tracing::info!(task_id, "Analysis job queued");
        Ok(TaskSubmitted {
            task_id: task_id.to_string(),
            status: TaskStatus::Pending,
        })
    }
}

#[async_trait]
impl JobQueue for WorkerPool {
    async fn submit(&self, request: AnalysisRequest) -> Result<TaskSubmitted, CoreError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.submit_with_id(&task_id, request).await
    }
}

async fn dispatch_loop(
    mut jobs: mpsc::Receiver<Job>,
    context: Arc<JobContext>,
    concurrency: usize,
    cancel: CancellationToken,
) {
    let slots = Arc::new(Semaphore::new(concurrency));
    let running = TaskTracker::new();
    tracing::info!(concurrency, "Worker pool started");

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                abandon(&context, job).await;
                break;
            }
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let context = Arc::clone(&context);
        let cancel = cancel.child_token();
        running.spawn(async move {
            execute(&context, job, &cancel).await;
            drop(permit);
        });
    }

    // Jobs still queued never started.
    jobs.close();
    while let Some(job) = jobs.recv().await {
        abandon(&context, job).await;
    }

    running.close();
    running.wait().await;
    tracing::info!("Worker pool stopped");
}

async fn execute(context: &JobContext, job: Job, cancel: &CancellationToken) {
    let reporter = ProgressReporter::new(
        job.task_id.clone(),
        job.channel,
        Arc::clone(&context.broker),
        Arc::clone(&context.tracker),
    );

    if let Err(e) = reporter.started().await {
        tracing::error!(task_id = %job.task_id, error = %e, "Failed to start analysis job");
        return;
    }
    tracing::info!(task_id = %job.task_id, url = %job.request.url, "Analysis job started");

    let outcome = match context.pipeline.run(&job.request, &reporter, cancel).await {
        Ok(result) => reporter.succeeded(result).await,
        Err(e) => {
            tracing::warn!(task_id = %job.task_id, error = %e, "Analysis job failed");
            reporter.failed(&e.to_string()).await
        }
    };

    match outcome {
        Ok(()) => tracing::info!(task_id = %job.task_id, "Analysis job finished"),
        Err(e) => {
            tracing::error!(task_id = %job.task_id, error = %e, "Failed to record job outcome")
        }
    }
}

async fn abandon(context: &JobContext, job: Job) {
    let reporter = ProgressReporter::new(
        job.task_id.clone(),
        job.channel,
        Arc::clone(&context.broker),
        Arc::clone(&context.tracker),
    );
    if let Err(e) = reporter.failed("worker pool shut down before the job ran").await {
        tracing::error!(task_id = %job.task_id, error = %e, "Failed to abandon queued job");
    }
}
