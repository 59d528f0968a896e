//! Scoped cancellation with ordered, exactly-once teardown.
//!
//! A [`Lifetime`] moves `Active -> Ending -> Ended` exactly once. Ending it
//! cancels its token, ends live children (newest first), runs the registered
//! cleanups in reverse registration order and finally waits for any
//! completion barriers. Any number of tasks or threads may call
//! [`Lifetime::end`]; one of them runs the teardown, the rest wait for it.

use crate::panic::{catch_async, catch_sync};
use crate::{Result, WeftError};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ACTIVE: u8 = 0;
const ENDING: u8 = 1;
const ENDED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
    Active,
    Ending,
    Ended,
}

/// A resource released when a lifetime ends.
pub trait Disposable: Send + 'static {
    fn dispose(&self);
}

impl Disposable for CancellationToken {
    fn dispose(&self) {
        self.cancel();
    }
}

impl Disposable for tokio::task::AbortHandle {
    fn dispose(&self) {
        self.abort();
    }
}

impl<T: Disposable + Sync + ?Sized> Disposable for Arc<T> {
    fn dispose(&self) {
        (**self).dispose();
    }
}

type AsyncAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

enum Cleanup {
    Sync(Box<dyn FnOnce() + Send>),
    Async(AsyncAction),
}

struct Inner {
    state: AtomicU8,
    token: CancellationToken,
    cleanups: Mutex<Vec<Cleanup>>,
    children: Mutex<BTreeMap<u64, Lifetime>>,
    next_child: AtomicU64,
    barriers: Mutex<Vec<BoxFuture<'static, ()>>>,
    parent: Option<(Weak<Inner>, u64)>,
    ended: watch::Sender<bool>,
    runtime: Option<Handle>,
}

/// Handle to a scope. Clones share the same scope.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<Inner>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self::build(None, CancellationToken::new(), Handle::try_current().ok())
    }

    fn build(
        parent: Option<(Weak<Inner>, u64)>,
        token: CancellationToken,
        runtime: Option<Handle>,
    ) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(ACTIVE),
                token,
                cleanups: Mutex::new(Vec::new()),
                children: Mutex::new(BTreeMap::new()),
                next_child: AtomicU64::new(0),
                barriers: Mutex::new(Vec::new()),
                parent,
                ended,
                runtime,
            }),
        }
    }

    pub fn state(&self) -> LifetimeState {
        match self.inner.state.load(Ordering::SeqCst) {
            ACTIVE => LifetimeState::Active,
            ENDING => LifetimeState::Ending,
            _ => LifetimeState::Ended,
        }
    }

    /// True once ending has begun.
    pub fn is_ending(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != ACTIVE
    }

    /// Cancellation token that fires as the first step of ending.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Resolves once ending has begun.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Resolves once teardown has fully completed.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        loop {
            let done = *rx.borrow_and_update();
            if done || rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Registers a cleanup. If ending has already begun the action runs immediately.
    pub fn do_on_ending<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(Cleanup::Sync(action)) = self.push_cleanup(Cleanup::Sync(Box::new(action))) {
            run_sync(action);
        }
    }

    /// Registers an async cleanup. Teardown awaits it before moving to the next one.
    pub fn do_on_ending_async<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cleanup = Cleanup::Async(Box::new(move || action().boxed()));
        if let Some(Cleanup::Async(action)) = self.push_cleanup(cleanup) {
            let late = run_async(action);
            match Handle::try_current().ok().or_else(|| self.inner.runtime.clone()) {
                Some(handle) => {
                    handle.spawn(late);
                }
                None => futures::executor::block_on(late),
            }
        }
    }

    /// Disposes `resource` when this lifetime ends and hands it back.
    pub fn to_dispose_on_ending<R>(&self, resource: R) -> R
    where
        R: Disposable + Clone,
    {
        let held = resource.clone();
        self.do_on_ending(move || held.dispose());
        resource
    }

    /// Defers the end of teardown until `completion` finishes. A failing
    /// stream counts as finished.
    pub fn do_not_end_until_completed<S, T, E>(&self, completion: S)
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Send,
        E: fmt::Display + Send,
    {
        let barrier = async move {
            let mut completion = Box::pin(completion);
            loop {
                match completion.next().await {
                    Some(Ok(_)) => continue,
                    None => break,
                    Some(Err(e)) => {
                        debug!(target: "lifetime", "completion barrier faulted: {}", e);
                        break;
                    }
                }
            }
        }
        .boxed();

        let mut barriers = lock(&self.inner.barriers);
        if self.inner.state.load(Ordering::SeqCst) == ENDED {
            debug!(target: "lifetime", "ignoring completion barrier on an ended lifetime");
            return;
        }
        barriers.push(barrier);
    }

    /// Single-future form of [`Lifetime::do_not_end_until_completed`].
    pub fn do_not_end_until<F>(&self, completion: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.do_not_end_until_completed(futures::stream::once(completion.map(Ok::<(), Infallible>)));
    }

    /// Creates a child scope, or `None` when this lifetime is already ending.
    pub fn child(&self) -> Option<Lifetime> {
        let mut children = lock(&self.inner.children);
        if self.inner.state.load(Ordering::SeqCst) != ACTIVE {
            return None;
        }
        let key = self.inner.next_child.fetch_add(1, Ordering::Relaxed);
        let runtime = self
            .inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());
        let child = Lifetime::build(
            Some((Arc::downgrade(&self.inner), key)),
            self.inner.token.child_token(),
            runtime,
        );
        children.insert(key, child.clone());
        Some(child)
    }

    /// Ends the lifetime. Returns after teardown is complete, whichever caller ran it.
    pub async fn end(&self) {
        if self.begin_ending() {
            self.teardown().await;
        } else {
            self.ended().await;
        }
    }

    /// Blocking form of [`Lifetime::end`] for non-async callers. Refused
    /// with [`WeftError::BlockingInAsync`] on a runtime thread, where
    /// blocking would stall the cleanups it waits for.
    pub fn end_blocking(&self) -> Result<()> {
        if Handle::try_current().is_ok() {
            return Err(WeftError::BlockingInAsync("Lifetime::end_blocking"));
        }
        match &self.inner.runtime {
            Some(handle) => handle.block_on(self.end()),
            None => futures::executor::block_on(self.end()),
        }
        Ok(())
    }

    fn push_cleanup(&self, cleanup: Cleanup) -> Option<Cleanup> {
        let mut cleanups = lock(&self.inner.cleanups);
        if self.inner.state.load(Ordering::SeqCst) == ACTIVE {
            cleanups.push(cleanup);
            None
        } else {
            Some(cleanup)
        }
    }

    // Registration paths check the state under these locks, so after the swap
    // nothing new lands on the stacks.
    fn begin_ending(&self) -> bool {
        let _cleanups = lock(&self.inner.cleanups);
        let _children = lock(&self.inner.children);
        self.inner
            .state
            .compare_exchange(ACTIVE, ENDING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // Boxed because ending children recurses into `end`.
    fn teardown(&self) -> BoxFuture<'_, ()> {
        async move {
            let inner = &self.inner;
            debug!(target: "lifetime", "lifetime ending");
            inner.token.cancel();

            if let Some((parent, key)) = &inner.parent {
                if let Some(parent) = parent.upgrade() {
                    lock(&parent.children).remove(key);
                }
            }

            let children = std::mem::take(&mut *lock(&inner.children));
            for child in children.into_values().rev() {
                child.end().await;
            }

            loop {
                let next = lock(&inner.cleanups).pop();
                match next {
                    Some(Cleanup::Sync(action)) => run_sync(action),
                    Some(Cleanup::Async(action)) => run_async(action).await,
                    None => break,
                }
            }

            loop {
                let next = {
                    let mut barriers = lock(&inner.barriers);
                    let next = barriers.pop();
                    if next.is_none() {
                        inner.state.store(ENDED, Ordering::SeqCst);
                    }
                    next
                };
                match next {
                    Some(barrier) => {
                        if let Err(msg) = catch_async(|| barrier).await {
                            warn!(target: "lifetime", "completion barrier panicked: {}", msg);
                        }
                    }
                    None => break,
                }
            }

            inner.ended.send_replace(true);
            debug!(target: "lifetime", "lifetime ended");
        }
        .boxed()
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("state", &self.state())
            .finish()
    }
}

fn run_sync(action: Box<dyn FnOnce() + Send>) {
    if let Err(msg) = catch_sync(action) {
        warn!(target: "lifetime", "cleanup action panicked: {}", msg);
    }
}

async fn run_async(action: AsyncAction) {
    if let Err(msg) = catch_async(action).await {
        warn!(target: "lifetime", "async cleanup action panicked: {}", msg);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
