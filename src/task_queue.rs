//! Fire-and-forget task dispatch.
//!
//! `enqueue` hands a unit of work to the worker pool and returns an opaque
//! handle immediately; it never waits for the task to run.

use crate::enrichment::EnrichmentPipeline;
use crate::errors::AppError;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A unit of enrichment work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    GeolocateIp { ip: String },
    ReverseGeocodeAddress { address_id: i32 },
    BackfillZipCode { address_id: i32 },
    ScanIncompleteAddresses,
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::GeolocateIp { .. } => "geolocate_ip",
            Task::ReverseGeocodeAddress { .. } => "reverse_geocode_address",
            Task::BackfillZipCode { .. } => "backfill_zip_code",
            Task::ScanIncompleteAddresses => "scan_incomplete_addresses",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskHandle(pub Uuid);

impl TaskHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: Task) -> Result<TaskHandle, AppError>;
}

type Envelope = (TaskHandle, Task);

/// In-process queue drained by a fixed pool of tokio workers.
#[derive(Clone)]
pub struct LocalTaskQueue {
    sender: mpsc::UnboundedSender<Envelope>,
}

impl TaskQueue for LocalTaskQueue {
    fn enqueue(&self, task: Task) -> Result<TaskHandle, AppError> {
        let handle = TaskHandle::new();
        self.sender
            .send((handle, task))
            .map_err(|e| AppError::InternalError(format!("task queue closed: {}", e.0 .1.name())))?;
        Ok(handle)
    }
}

/// Running workers plus the signal that stops them.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Stops taking new tasks and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Task worker exited abnormally: {}", e);
            }
        }
        tracing::info!("Task workers stopped");
    }
}

impl LocalTaskQueue {
    /// Creates the queue and spawns `worker_count` workers that run tasks
    /// against `pipeline`.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - Shared pipeline every worker executes tasks on
    /// * `worker_count` - Number of tasks that may run at the same time
    ///
    /// # Returns
    ///
    /// The queue handle for producers and the pool handle for shutdown.
    pub fn start(pipeline: Arc<EnrichmentPipeline>, worker_count: usize) -> (Self, WorkerPool) {
        let (sender, receiver) = mpsc::unbounded_channel::<Envelope>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Self { sender };

        let workers = (0..worker_count.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&receiver),
                    shutdown_rx.clone(),
                    Arc::clone(&pipeline),
                    queue.clone(),
                ))
            })
            .collect();

        tracing::info!("✓ Task queue started with {} workers", worker_count.max(1));
        (
            queue,
            WorkerPool {
                workers,
                shutdown: shutdown_tx,
            },
        )
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    mut shutdown: watch::Receiver<bool>,
    pipeline: Arc<EnrichmentPipeline>,
    queue: LocalTaskQueue,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => None,
            message = async { receiver.lock().await.recv().await } => message,
        };
        let Some((handle, task)) = next else {
            break;
        };

        let name = task.name();
        tracing::debug!(worker_id, task_id = %handle.0, task = name, "Running task");

        // A panicking task must not take the worker down with it.
        let pipeline = Arc::clone(&pipeline);
        let queue = queue.clone();
        let run = tokio::spawn(async move { pipeline.execute(task, &queue).await });
        match run.await {
            Ok(summary) => {
                tracing::debug!(worker_id, task_id = %handle.0, task = name, "{}", summary)
            }
            Err(e) => tracing::error!(
                severity = "critical",
                worker_id,
                task_id = %handle.0,
                task = name,
                "Task aborted: {}",
                e
            ),
        }
    }
    tracing::debug!(worker_id, "Task worker stopping");
}

/// Queue that records tasks instead of running them.
#[derive(Default)]
pub struct RecordingQueue {
    tasks: StdMutex<Vec<Task>>,
    reject_address_ids: StdMutex<Vec<i32>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `enqueue` fail for backfill tasks targeting `address_id`.
    pub fn reject_address(&self, address_id: i32) {
        if let Ok(mut rejected) = self.reject_address_ids.lock() {
            rejected.push(address_id);
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.clear();
        }
    }
}

impl TaskQueue for RecordingQueue {
    fn enqueue(&self, task: Task) -> Result<TaskHandle, AppError> {
        if let Task::BackfillZipCode { address_id } = task {
            let rejected = self
                .reject_address_ids
                .lock()
                .map(|r| r.contains(&address_id))
                .unwrap_or(false);
            if rejected {
                return Err(AppError::InternalError(format!(
                    "queue rejected backfill of address {}",
                    address_id
                )));
            }
        }

        self.tasks
            .lock()
            .map_err(|_| AppError::InternalError("recording queue poisoned".to_string()))?
            .push(task);
        Ok(TaskHandle::new())
    }
}
