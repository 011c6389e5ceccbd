#![warn(missing_docs)]
//! # scenecap-runtime
//!
//! ## Purpose
//! The concurrency substrate the rest of the pipeline is built on: typed
//! senders/listeners, direct and queued connections with a configurable
//! overflow policy, single-threaded cooperative worker runners, a runner
//! controller, and a cancellable one-shot timer.
//!
//! ## Responsibilities
//! - [`Sender`] — fire-and-forget publish to whatever is listening.
//! - [`DirectConnection`] — synchronous dispatch on the caller's thread.
//! - [`QueuedConnection`] — enqueue now, drain later on a worker thread,
//!   with [`OverflowPolicy::Block`] or [`OverflowPolicy::Discard`] behavior
//!   once the queue is full.
//! - [`SingleThreadRunner`] — owns one worker thread hosting any number of
//!   queued connections, polling them on an 8 ms cadence so shutdown stays
//!   cooperative and prompt.
//! - [`RunnerController`] — starts a set of runners together and tears them
//!   down in reverse order.
//! - [`Timer`] — a cancellable one-shot timer guaranteeing exactly one of
//!   `on_expire`/`on_cancel` fires.
//!
//! ## Data flow
//! Producers call `send` on a connection; for a queued connection this only
//! enqueues the value. The owning [`SingleThreadRunner`]'s worker thread
//! polls every registered connection and invokes the listener registered via
//! `listen` for each drained item, in FIFO order per connection. No
//! ordering guarantee holds across connections.
//!
//! ## Ownership and lifetimes
//! Connections are reference-counted (`Arc`) so both the producer and the
//! owning runner can hold a handle. A runner's worker thread owns no
//! application state directly — all of it lives inside the connections it
//! polls.
//!
//! ## Error model
//! [`RuntimeError`] covers the one way this crate can fail outside of
//! programmer error: failing to spawn a worker thread. Programmer-error
//! conditions (calling [`SingleThreadRunner::make_connection`] after
//! [`SingleThreadRunner::start`]) are `assert!`-style panics, not `Result`s.
//!
//! ## Security and privacy notes
//! None — this crate moves opaque payloads between threads and never
//! inspects their contents.
//!
//! ## Example
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use scenecap_runtime::{OverflowPolicy, SingleThreadRunner, Sender};
//!
//! let runner = SingleThreadRunner::new("demo");
//! let seen = Arc::new(AtomicU32::new(0));
//! let connection = runner.make_connection::<u32>(8, OverflowPolicy::Discard);
//! let seen_in_handler = seen.clone();
//! connection.listen(move |value| {
//!     seen_in_handler.fetch_add(value, Ordering::SeqCst);
//! });
//! runner.start().unwrap();
//! connection.send(41);
//! connection.send(1);
//! runner.stop();
//! runner.join();
//! assert_eq!(seen.load(Ordering::SeqCst), 42);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// The runner's cooperative wakeup cadence: how often an idle worker thread
/// checks whether it should keep running or has new work, bounding shutdown
/// latency.
pub const RUNNER_WAKEUP_INTERVAL: Duration = Duration::from_millis(8);

/// Errors surfaced by the runtime substrate itself (as opposed to
/// programmer-error panics).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Spawning a runner's worker thread failed.
    #[error("failed to spawn runner thread '{name}': {source}")]
    Spawn {
        /// The runner's name, for diagnostics.
        name: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
}

/// Fire-and-forget publish. Implemented by both [`DirectConnection`] and
/// [`QueuedConnection`] so downstream crates can hold a `Arc<dyn Sender<T>>`
/// without caring which dispatch strategy backs it.
pub trait Sender<T>: Send + Sync {
    /// Publishes a value. For a direct connection this calls the listener
    /// synchronously; for a queued connection this only enqueues it.
    fn send(&self, value: T);
}

/// A connection with no buffering: `send` invokes the registered listener
/// synchronously, on the caller's thread.
pub struct DirectConnection<T> {
    handler: Mutex<Option<Box<dyn Fn(T) + Send>>>,
}

impl<T: Send + 'static> DirectConnection<T> {
    /// Builds an unconnected direct connection.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
        })
    }

    /// Registers the handler invoked on every `send`. Replaces any
    /// previously registered handler.
    pub fn listen(&self, handler: impl Fn(T) + Send + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }
}

impl<T: Send + 'static> Sender<T> for DirectConnection<T> {
    fn send(&self, value: T) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(value);
        }
    }
}

/// How a [`QueuedConnection`] behaves once its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Back-pressure the sender until space frees up. Used for video-file
    /// playback, where no frame may be dropped.
    Block,
    /// Silently drop the newest (incoming) item. Used for live screen
    /// capture, where bounded latency matters more than completeness.
    Discard,
}

/// A connection that enqueues sent values for later processing by a
/// [`SingleThreadRunner`]'s worker thread, in FIFO order.
pub struct QueuedConnection<T> {
    queue: Mutex<VecDeque<T>>,
    not_full: Condvar,
    capacity: usize,
    policy: OverflowPolicy,
    handler: Mutex<Option<Box<dyn Fn(T) + Send>>>,
}

impl<T: Send + 'static> QueuedConnection<T> {
    /// Builds a queued connection with the given buffer `capacity` and
    /// overflow behavior.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Arc<Self> {
        assert!(capacity > 0, "QueuedConnection capacity must be positive");
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            capacity,
            policy,
            handler: Mutex::new(None),
        })
    }

    /// Registers the handler invoked for each drained item.
    pub fn listen(&self, handler: impl Fn(T) + Send + 'static) {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// `true` iff no items are currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Sender<T> for QueuedConnection<T> {
    fn send(&self, value: T) {
        let mut queue = self.queue.lock().unwrap();
        match self.policy {
            OverflowPolicy::Discard => {
                if queue.len() < self.capacity {
                    queue.push_back(value);
                }
            }
            OverflowPolicy::Block => {
                while queue.len() >= self.capacity {
                    queue = self.not_full.wait(queue).unwrap();
                }
                queue.push_back(value);
            }
        }
    }
}

/// Type-erased interface a [`SingleThreadRunner`] uses to poll every
/// queued connection it owns without knowing their payload types.
trait QueueProcessor: Send + Sync {
    /// Drains and processes exactly one pending item, if any. Returns
    /// `true` iff an item was processed.
    fn process_one(&self) -> bool;
}

impl<T: Send + 'static> QueueProcessor for QueuedConnection<T> {
    fn process_one(&self) -> bool {
        let item = {
            let mut queue = self.queue.lock().unwrap();
            let item = queue.pop_front();
            if item.is_some() {
                self.not_full.notify_one();
            }
            item
        };
        match item {
            Some(value) => {
                if let Some(handler) = self.handler.lock().unwrap().as_ref() {
                    handler(value);
                }
                true
            }
            None => false,
        }
    }
}

/// Owns one worker thread hosting any number of queued connections. The
/// thread polls every registered connection on an
/// [`RUNNER_WAKEUP_INTERVAL`] cadence, draining each to empty before
/// sleeping again.
pub struct SingleThreadRunner {
    name: String,
    running: Arc<AtomicBool>,
    processors: Mutex<Vec<Arc<dyn QueueProcessor>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    detach: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SingleThreadRunner {
    /// Builds an unstarted runner with no registered connections.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            processors: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
            detach: Mutex::new(None),
        })
    }

    /// Registers a hook invoked once on the worker thread right before it
    /// exits, mirroring the original host's need to unbind thread-local
    /// resources on shutdown.
    pub fn on_detach(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.detach.lock().unwrap() = Some(Box::new(hook));
    }

    /// Registers and returns a new queued connection hosted by this
    /// runner. Must be called before [`SingleThreadRunner::start`] —
    /// registering connections on a running runner is a programming error.
    pub fn make_connection<T: Send + 'static>(
        &self,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Arc<QueuedConnection<T>> {
        assert!(
            !self.is_running(),
            "make_connection called on a running SingleThreadRunner"
        );
        let connection = QueuedConnection::new(capacity, policy);
        self.processors
            .lock()
            .unwrap()
            .push(connection.clone() as Arc<dyn QueueProcessor>);
        connection
    }

    /// `true` iff the worker thread has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The runner's name, used for thread naming and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the worker thread.
    pub fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.is_running() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let runner = self.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let processors = runner.processors.lock().unwrap().clone();
                    let mut processed_any = false;
                    for processor in &processors {
                        while processor.process_one() {
                            processed_any = true;
                        }
                    }
                    if !processed_any {
                        std::thread::sleep(RUNNER_WAKEUP_INTERVAL);
                    }
                }
                if let Some(hook) = runner.detach.lock().unwrap().as_ref() {
                    hook();
                }
                tracing::debug!(runner = runner.name.as_str(), "runner thread exiting");
            })
            .map_err(|source| RuntimeError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        *self.handle.lock().unwrap() = Some(handle);
        tracing::debug!(runner = self.name.as_str(), "runner thread started");
        Ok(())
    }

    /// Signals the worker thread to stop after its current poll cycle.
    /// Does not block — call [`SingleThreadRunner::join`] to wait for
    /// drain and thread exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Waits for the worker thread to exit. No-op if never started or
    /// already joined.
    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Starts and tears down a set of [`SingleThreadRunner`]s together,
/// stopping and joining them in the reverse of their `add` order so that
/// downstream stages (added last) drain and exit before the upstream
/// stages feeding them.
#[derive(Default)]
pub struct RunnerController {
    runners: Mutex<Vec<Arc<SingleThreadRunner>>>,
}

impl RunnerController {
    /// Builds a controller with no runners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runner. Order matters: [`RunnerController::join`] tears
    /// runners down in reverse of this order.
    pub fn add(&self, runner: Arc<SingleThreadRunner>) {
        self.runners.lock().unwrap().push(runner);
    }

    /// Starts every registered runner, in `add` order.
    pub fn start(&self) -> Result<(), RuntimeError> {
        for runner in self.runners.lock().unwrap().iter() {
            runner.start()?;
        }
        Ok(())
    }

    /// `true` iff any registered runner is still running.
    pub fn is_running(&self) -> bool {
        self.runners.lock().unwrap().iter().any(|r| r.is_running())
    }

    /// Stops and joins every registered runner, in reverse `add` order.
    pub fn join(&self) {
        let runners = self.runners.lock().unwrap();
        for runner in runners.iter().rev() {
            runner.stop();
            runner.join();
        }
    }
}

/// Wraps an outer two-argument sender so that sending a single value `T`
/// prepends a fixed, pre-bound first argument `A` and forwards the pair.
/// Mirrors the original event substrate's `bindLeft` helper, used to
/// route a single tab's scroll events into a shared `(tab_index, ...)`
/// sender.
pub fn bind_left<A, T>(outer: Arc<dyn Sender<(A, T)>>, bound: A) -> Arc<dyn Sender<T>>
where
    A: Clone + Send + Sync + 'static,
    T: Send + 'static,
{
    Arc::new(BoundLeftSender { outer, bound })
}

struct BoundLeftSender<A, T> {
    outer: Arc<dyn Sender<(A, T)>>,
    bound: A,
}

impl<A: Clone + Send + Sync + 'static, T: Send + 'static> Sender<T> for BoundLeftSender<A, T> {
    fn send(&self, value: T) {
        self.outer.send((self.bound.clone(), value));
    }
}

/// A cancellable one-shot timer. Exactly one of `on_expire`/`on_cancel`
/// fires, guaranteed by construction: the spawned thread waits on a
/// condition variable until either the duration elapses or `cancel` is
/// called, and runs exactly one of the two callbacks before exiting.
pub struct Timer {
    cancel_state: Arc<(Mutex<bool>, Condvar)>,
    expired: Arc<Mutex<Option<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Starts the timer immediately. `on_cancel` is optional: a timer with
    /// no cancellation callback simply does nothing extra when cancelled.
    pub fn start(
        duration: Duration,
        on_expire: impl FnOnce() + Send + 'static,
        on_cancel: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        let cancel_state = Arc::new((Mutex::new(false), Condvar::new()));
        let expired = Arc::new(Mutex::new(None));

        let cancel_state_thread = cancel_state.clone();
        let expired_thread = expired.clone();
        let handle = std::thread::spawn(move || {
            let (lock, condvar) = &*cancel_state_thread;
            let guard = lock.lock().unwrap();
            let (_guard, wait_result) = condvar
                .wait_timeout_while(guard, duration, |cancelled| !*cancelled)
                .unwrap();

            if wait_result.timed_out() {
                *expired_thread.lock().unwrap() = Some(true);
                on_expire();
            } else {
                *expired_thread.lock().unwrap() = Some(false);
                if let Some(on_cancel) = on_cancel {
                    on_cancel();
                }
            }
        });

        Self {
            cancel_state,
            expired,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Cancels the timer if still pending. Idempotent: cancelling an
    /// already-expired or already-cancelled timer is a no-op. Blocks until
    /// the timer's thread has fully exited.
    pub fn cancel(&self) {
        {
            let (lock, condvar) = &*self.cancel_state;
            let mut cancelled = lock.lock().unwrap();
            *cancelled = true;
            condvar.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// `None` while the timer's final state is still settling (the
    /// completion thread holds the lock); `Some(true)` if it expired,
    /// `Some(false)` if it was cancelled. Never blocks.
    pub fn has_expired(&self) -> Option<bool> {
        self.expired.try_lock().ok().and_then(|guard| *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn direct_connection_dispatches_synchronously() {
        let connection = DirectConnection::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        connection.listen(move |value| seen_in_handler.lock().unwrap().push(value));
        connection.send(1);
        connection.send(2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn queued_connection_discards_newest_when_full() {
        let connection = QueuedConnection::<u32>::new(2, OverflowPolicy::Discard);
        connection.send(1);
        connection.send(2);
        connection.send(3); // dropped, queue already at capacity
        assert_eq!(connection.len(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        connection.listen(move |value| seen_in_handler.lock().unwrap().push(value));
        while connection.process_one() {}
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn single_thread_runner_processes_in_fifo_order() {
        let runner = SingleThreadRunner::new("fifo-test");
        let connection = runner.make_connection::<u32>(16, OverflowPolicy::Discard);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        connection.listen(move |value| seen_in_handler.lock().unwrap().push(value));

        runner.start().unwrap();
        for value in 0..10 {
            connection.send(value);
        }
        // Give the 8 ms poll loop a couple of cycles to drain.
        std::thread::sleep(Duration::from_millis(50));
        runner.stop();
        runner.join();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn runner_controller_tears_down_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let controller = RunnerController::new();
        for id in 0..3 {
            let runner = SingleThreadRunner::new(format!("runner-{id}"));
            let order_in_hook = order.clone();
            runner.on_detach(move || order_in_hook.lock().unwrap().push(id));
            controller.add(runner);
        }
        controller.start().unwrap();
        controller.join();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn timer_fires_on_expire_when_not_cancelled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_expire = fired.clone();
        let timer = Timer::start(
            Duration::from_millis(10),
            move || {
                fired_in_expire.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(timer.has_expired(), Some(true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_fires_on_cancel_when_cancelled_before_expiry() {
        let expired_calls = Arc::new(AtomicUsize::new(0));
        let cancelled_calls = Arc::new(AtomicUsize::new(0));
        let expired_in_expire = expired_calls.clone();
        let cancelled_in_cancel = cancelled_calls.clone();

        let timer = Timer::start(
            Duration::from_secs(10),
            move || {
                expired_in_expire.fetch_add(1, Ordering::SeqCst);
            },
            Some(Box::new(move || {
                cancelled_in_cancel.fetch_add(1, Ordering::SeqCst);
            })),
        );
        timer.cancel();

        assert_eq!(timer.has_expired(), Some(false));
        assert_eq!(expired_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bind_left_prepends_bound_argument() {
        let outer = DirectConnection::<(u8, u32)>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        outer.listen(move |pair| seen_in_handler.lock().unwrap().push(pair));

        let bound = bind_left(outer.clone() as Arc<dyn Sender<(u8, u32)>>, 7u8);
        bound.send(100);
        bound.send(200);

        assert_eq!(*seen.lock().unwrap(), vec![(7, 100), (7, 200)]);
    }
}
