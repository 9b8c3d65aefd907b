//! Bounded worker pools with warm/cold timeout budgets.
//!
//! A [`WorkerPool`] owns a fixed number of [`Worker`]s fed from one job
//! queue. Each submission waits for its result under a wall-clock budget:
//! `base + startup_buffer` while the pool is cold (workers may still be
//! loading libraries or models), `base` alone once a task has succeeded.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --first submit--> Cold --success--> Warm
//!       Cold/Warm --timeout--> Abandoned --next submit--> Cold
//! ```
//!
//! Abandoning drops the pool handle without waiting: worker tasks are
//! aborted, which drops their workers (child processes are killed on drop).
//! `Unsupported` and `Error` outcomes never change the state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const CONVERSION_WORKERS: usize = 2;
pub const EMBEDDING_WORKERS: usize = 1;
pub const CONVERSION_STARTUP_BUFFER: Duration = Duration::from_secs(15);
pub const EMBEDDING_STARTUP_BUFFER: Duration = Duration::from_secs(20);

/// Result of one pooled task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Success(T),
    Unsupported(String),
    Error(String),
    /// Produced by the pool, never by a worker.
    Timeout,
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// One isolated unit of work capacity.
#[async_trait]
pub trait Worker<Req, P>: Send {
    async fn handle(&mut self, req: Req) -> TaskOutcome<P>;
}

/// Builds fresh workers when a pool is created or recreated.
pub trait WorkerFactory<Req, P>: Send + Sync {
    fn spawn(&self) -> anyhow::Result<Box<dyn Worker<Req, P>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Uninitialized,
    Cold,
    Warm,
    Abandoned,
}

type Job<Req, P> = (Req, oneshot::Sender<TaskOutcome<P>>);

struct PoolHandle<Req, P> {
    jobs: mpsc::Sender<Job<Req, P>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<Req, P> Drop for PoolHandle<Req, P> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct WorkerPool<Req, P> {
    name: &'static str,
    factory: Arc<dyn WorkerFactory<Req, P>>,
    size: usize,
    base_timeout: Duration,
    startup_buffer: Duration,
    handle: Option<PoolHandle<Req, P>>,
    state: PoolState,
}

impl<Req, P> WorkerPool<Req, P>
where
    Req: Send + 'static,
    P: Send + 'static,
{
    pub fn new(
        name: &'static str,
        factory: Arc<dyn WorkerFactory<Req, P>>,
        size: usize,
        base_timeout: Duration,
        startup_buffer: Duration,
    ) -> Self {
        Self {
            name,
            factory,
            size: size.max(1),
            base_timeout,
            startup_buffer,
            handle: None,
            state: PoolState::Uninitialized,
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn is_warm(&self) -> bool {
        self.state == PoolState::Warm
    }

    /// Budget the next submission will get.
    pub fn effective_timeout(&self) -> Duration {
        if self.is_warm() {
            self.base_timeout
        } else {
            self.base_timeout + self.startup_buffer
        }
    }

    /// Run `req` on a worker, waiting at most [`Self::effective_timeout`].
    pub async fn submit(&mut self, req: Req) -> TaskOutcome<P> {
        let budget = self.effective_timeout();
        let reply = match self.enqueue(req).await {
            Ok(reply) => reply,
            Err(message) => return TaskOutcome::Error(message),
        };

        match tokio::time::timeout(budget, reply).await {
            Ok(Ok(outcome)) => {
                if outcome.is_success() {
                    self.state = PoolState::Warm;
                }
                outcome
            }
            Ok(Err(_)) => {
                warn!("{} worker exited without replying; recreating pool", self.name);
                self.abandon();
                TaskOutcome::Error(format!("{} worker exited unexpectedly", self.name))
            }
            Err(_) => {
                warn!(
                    "{} task exceeded {:?}; abandoning worker pool",
                    self.name, budget
                );
                self.abandon();
                TaskOutcome::Timeout
            }
        }
    }

    /// Submit a trivial task with the startup buffer as budget.
    ///
    /// Success marks the pool warm. Failure or timeout only forfeits the
    /// warm budget: the pool is kept so a slow-loading worker can finish.
    pub async fn warm_up(&mut self, req: Req) -> bool {
        let reply = match self.enqueue(req).await {
            Ok(reply) => reply,
            Err(message) => {
                debug!("{} warm-up skipped: {}", self.name, message);
                return false;
            }
        };

        match tokio::time::timeout(self.startup_buffer, reply).await {
            Ok(Ok(TaskOutcome::Success(_))) => {
                self.state = PoolState::Warm;
                debug!("{} pool warm", self.name);
                true
            }
            Ok(Ok(other)) => {
                debug!("{} warm-up did not succeed: {:?}", self.name, outcome_label(&other));
                false
            }
            Ok(Err(_)) => {
                debug!("{} warm-up lost its worker", self.name);
                false
            }
            Err(_) => {
                debug!(
                    "{} warm-up still running after {:?}; continuing cold",
                    self.name, self.startup_buffer
                );
                false
            }
        }
    }

    /// Drop the pool without waiting for in-flight work.
    ///
    /// Worker tasks are aborted here, but an aborted task only drops its
    /// worker (and kills its child process) the next time the runtime polls
    /// it. A caller that blocks its thread right after this returns can
    /// still observe live worker processes for a moment.
    pub fn shutdown(&mut self) {
        if self.handle.take().is_some() {
            debug!("{} pool shut down", self.name);
        }
        self.state = PoolState::Uninitialized;
    }

    fn abandon(&mut self) {
        self.handle = None;
        self.state = PoolState::Abandoned;
    }

    async fn enqueue(&mut self, req: Req) -> Result<oneshot::Receiver<TaskOutcome<P>>, String> {
        if self.handle.is_none() {
            self.handle = Some(self.start()?);
            self.state = PoolState::Cold;
        }
        let Some(handle) = self.handle.as_ref() else {
            return Err(format!("{} pool unavailable", self.name));
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.jobs.send((req, reply_tx)).await.is_err() {
            self.abandon();
            return Err(format!("{} pool is closed", self.name));
        }
        Ok(reply_rx)
    }

    fn start(&self) -> Result<PoolHandle<Req, P>, String> {
        let (jobs, queue) = mpsc::channel::<Job<Req, P>>(self.size);
        let queue = Arc::new(Mutex::new(queue));

        let mut tasks = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            let worker = match self.factory.spawn() {
                Ok(worker) => worker,
                Err(e) => {
                    tasks.iter().for_each(JoinHandle::abort);
                    return Err(format!("failed to start {} worker: {:#}", self.name, e));
                }
            };
            tasks.push(tokio::spawn(run_worker(worker, queue.clone())));
        }
        debug!("{} pool started with {} worker(s)", self.name, self.size);
        Ok(PoolHandle { jobs, tasks })
    }
}

async fn run_worker<Req, P>(
    mut worker: Box<dyn Worker<Req, P>>,
    queue: Arc<Mutex<mpsc::Receiver<Job<Req, P>>>>,
) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some((req, reply)) = job else {
            break;
        };
        let outcome = worker.handle(req).await;
        let _ = reply.send(outcome);
    }
}

fn outcome_label<T>(outcome: &TaskOutcome<T>) -> String {
    match outcome {
        TaskOutcome::Success(_) => "success".to_string(),
        TaskOutcome::Unsupported(m) => format!("unsupported: {}", m),
        TaskOutcome::Error(m) => format!("error: {}", m),
        TaskOutcome::Timeout => "timeout".to_string(),
    }
}
