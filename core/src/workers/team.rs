// Worker team: shared queue, fixed workers, penalty-driven retry
use super::policy::PenaltyInfo;
use crate::lifetime::Lifetime;
use crate::panic::{catch_async, catch_sync};
use crate::{Result, WeftError};
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How the team's workers are placed.
#[derive(Debug, Clone)]
pub enum TeamLayout {
    /// `n` workers on the ambient runtime.
    Workers(usize),
    /// One worker per handle.
    Contexts(Vec<Handle>),
}

impl TeamLayout {
    fn len(&self) -> usize {
        match self {
            TeamLayout::Workers(n) => *n,
            TeamLayout::Contexts(handles) => handles.len(),
        }
    }
}

/// What a routine sees for one attempt of a job.
#[derive(Debug, Clone)]
pub struct JobContext<J> {
    pub id: u64,
    pub job: J,
    /// Failures recorded before this attempt.
    pub failed_counter: u32,
    pub worker_index: usize,
    /// Cancelled when the team's lifetime ends.
    pub token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job rejected")]
    Rejected,

    #[error("job failed: {0}")]
    Failed(String),

    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Input to the penalty function.
#[derive(Debug)]
pub struct JobFailure<'a, J> {
    pub id: u64,
    pub job: &'a J,
    /// Failures so far, including this one.
    pub failed_count: u32,
    pub error: &'a JobError,
}

#[derive(Debug, Clone)]
pub enum JobEvent<J> {
    Completed { id: u64, job: J },
    Failed { id: u64, job: J, failed_count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { failed_count: u32 },
}

/// Snapshot of team counters. `failed` counts jobs given up on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamState {
    pub running: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

struct JobInfo<J> {
    id: u64,
    job: J,
    failed_counter: u32,
}

type Routine<J> = Box<dyn Fn(JobContext<J>) -> BoxFuture<'static, std::result::Result<(), JobError>> + Send + Sync>;
type Penalty<J> = Box<dyn for<'a> Fn(&JobFailure<'a, J>) -> PenaltyInfo + Send + Sync>;

struct Shared<J> {
    queue: SegQueue<JobInfo<J>>,
    wakers: Vec<Arc<Notify>>,
    next_id: AtomicU64,
    running: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    events: broadcast::Sender<JobEvent<J>>,
    waiters: DashMap<u64, oneshot::Sender<JobOutcome>>,
    token: CancellationToken,
    routine: Routine<J>,
    penalty: Penalty<J>,
}

/// Handle to a running team. Clones share the same workers and queue.
pub struct WorkerTeam<J> {
    shared: Arc<Shared<J>>,
}

impl<J> Clone for WorkerTeam<J> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J> WorkerTeam<J>
where
    J: Clone + Send + Sync + 'static,
{
    /// Starts a team fed by [`WorkerTeam::post`] and [`WorkerTeam::do_work`].
    /// Fails with [`WeftError::NoRuntime`] when the layout is `Workers` and
    /// there is no ambient Tokio runtime.
    pub fn start<R, Fut, P>(
        routine: R,
        penalty: P,
        lifetime: &Lifetime,
        layout: TeamLayout,
    ) -> Result<Self>
    where
        R: Fn(JobContext<J>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
        P: for<'a> Fn(&JobFailure<'a, J>) -> PenaltyInfo + Send + Sync + 'static,
    {
        let count = layout.len();
        if count == 0 {
            return Err(WeftError::InvalidArgument(
                "a worker team needs at least one worker".to_string(),
            ));
        }
        if lifetime.is_ending() {
            return Err(WeftError::Closed("lifetime"));
        }

        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            wakers: (0..count).map(|_| Arc::new(Notify::new())).collect(),
            next_id: AtomicU64::new(1),
            running: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            events,
            waiters: DashMap::new(),
            token: lifetime.token(),
            routine: Box::new(move |ctx: JobContext<J>| routine(ctx).boxed()),
            penalty: Box::new(penalty),
        });

        let handles = match layout {
            TeamLayout::Workers(n) => {
                let ambient =
                    Handle::try_current().map_err(|_| WeftError::NoRuntime("worker team"))?;
                vec![ambient; n]
            }
            TeamLayout::Contexts(handles) => handles,
        };
        for (index, handle) in handles.iter().enumerate() {
            handle.spawn(worker_loop(Arc::clone(&shared), index));
        }

        let weak = Arc::downgrade(&shared);
        lifetime.do_on_ending(move || {
            if let Some(shared) = weak.upgrade() {
                // Pending do_work callers observe the closed channel.
                shared.waiters.clear();
            }
        });

        debug!(target: "workers", workers = count, "worker team started");
        Ok(Self { shared })
    }

    /// Like [`WorkerTeam::start`], also pumping every item of `source` into the queue.
    pub fn run<S, R, Fut, P>(
        source: S,
        routine: R,
        penalty: P,
        lifetime: &Lifetime,
        layout: TeamLayout,
    ) -> Result<Self>
    where
        S: Stream<Item = J> + Send + 'static,
        R: Fn(JobContext<J>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), JobError>> + Send + 'static,
        P: for<'a> Fn(&JobFailure<'a, J>) -> PenaltyInfo + Send + Sync + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| WeftError::NoRuntime("worker team"))?;
        let team = Self::start(routine, penalty, lifetime, layout)?;
        let pump = team.clone();
        let token = lifetime.token();
        runtime.spawn(async move {
            let mut source = Box::pin(source);
            loop {
                let job = tokio::select! {
                    _ = token.cancelled() => break,
                    job = source.next() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                pump.post(job);
            }
            trace!(target: "workers", "job source drained");
        });
        Ok(team)
    }

    /// Queues a job. Returns false once the team's lifetime is ending.
    pub fn post(&self, job: J) -> bool {
        if self.shared.token.is_cancelled() {
            return false;
        }
        let id = self.shared.next_id();
        self.shared.enqueue(JobInfo {
            id,
            job,
            failed_counter: 0,
        });
        true
    }

    /// Queues a job and waits for its terminal outcome.
    pub async fn do_work(&self, job: J) -> Result<JobOutcome> {
        if self.shared.token.is_cancelled() {
            return Err(WeftError::Closed("worker team"));
        }
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.waiters.insert(id, tx);
        self.shared.enqueue(JobInfo {
            id,
            job,
            failed_counter: 0,
        });
        rx.await.map_err(|_| WeftError::Closed("worker team"))
    }

    /// Completion and terminal-failure notifications.
    pub fn events(&self) -> broadcast::Receiver<JobEvent<J>> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> TeamState {
        TeamState {
            running: self.shared.running.load(Ordering::SeqCst),
            queued: self.shared.queued.load(Ordering::SeqCst),
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    pub fn workers(&self) -> usize {
        self.shared.wakers.len()
    }
}

impl<J> Shared<J>
where
    J: Clone + Send + Sync + 'static,
{
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, info: JobInfo<J>) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.queue.push(info);
        for waker in &self.wakers {
            waker.notify_one();
        }
    }

    fn complete(&self, info: JobInfo<J>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if let Some((_, tx)) = self.waiters.remove(&info.id) {
            let _ = tx.send(JobOutcome::Completed);
        }
        let _ = self.events.send(JobEvent::Completed {
            id: info.id,
            job: info.job,
        });
    }

    fn fail(self: &Arc<Self>, info: JobInfo<J>, error: JobError) {
        let info = JobInfo {
            failed_counter: info.failed_counter.saturating_add(1),
            ..info
        };
        let failure = JobFailure {
            id: info.id,
            job: &info.job,
            failed_count: info.failed_counter,
            error: &error,
        };
        let penalty = catch_sync(|| (self.penalty)(&failure)).unwrap_or_else(|msg| {
            warn!(target: "workers", job = info.id, "penalty function panicked: {}", msg);
            PenaltyInfo::give_up()
        });

        if !penalty.try_again || self.token.is_cancelled() {
            debug!(target: "workers", job = info.id, failures = info.failed_counter, "giving up on job: {}", error);
            self.failed.fetch_add(1, Ordering::SeqCst);
            let failed_count = info.failed_counter;
            if let Some((_, tx)) = self.waiters.remove(&info.id) {
                let _ = tx.send(JobOutcome::Failed { failed_count });
            }
            let _ = self.events.send(JobEvent::Failed {
                id: info.id,
                job: info.job,
                failed_count,
            });
            return;
        }

        match penalty.delay {
            None => self.enqueue(info),
            Some(delay) => {
                trace!(target: "workers", job = info.id, ?delay, "job scheduled for retry");
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shared.token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => shared.enqueue(info),
                    }
                });
            }
        }
    }
}

async fn worker_loop<J>(shared: Arc<Shared<J>>, index: usize)
where
    J: Clone + Send + Sync + 'static,
{
    let wake = Arc::clone(&shared.wakers[index]);
    loop {
        while let Some(info) = shared.queue.pop() {
            shared.queued.fetch_sub(1, Ordering::SeqCst);
            if shared.token.is_cancelled() {
                break;
            }

            shared.running.fetch_add(1, Ordering::SeqCst);
            let ctx = JobContext {
                id: info.id,
                job: info.job.clone(),
                failed_counter: info.failed_counter,
                worker_index: index,
                token: shared.token.clone(),
            };
            let outcome = match catch_async(|| (shared.routine)(ctx)).await {
                Ok(outcome) => outcome,
                Err(msg) => Err(JobError::Panicked(msg)),
            };
            match outcome {
                Ok(()) => shared.complete(info),
                Err(error) => shared.fail(info, error),
            }
            shared.running.fetch_sub(1, Ordering::SeqCst);
        }

        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = wake.notified() => {}
        }
    }
    trace!(target: "workers", worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_workers_rejected() {
        let lifetime = Lifetime::new();
        let result = WorkerTeam::<u32>::start(
            |_ctx| async { Ok(()) },
            |_f: &JobFailure<'_, u32>| PenaltyInfo::give_up(),
            &lifetime,
            TeamLayout::Workers(0),
        );
        assert!(matches!(result, Err(WeftError::InvalidArgument(_))));
    }
}
