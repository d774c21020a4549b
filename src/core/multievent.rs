//! Barrier over a dynamic set of events
//!
//! Each [`SingleEvent`] is pending from creation until its owner calls
//! [`SingleEvent::set`]. The [`MultiEvent`] is satisfied once no event is
//! pending. Used to learn when all interfaces are listening or all pollers
//! have finished their first sweep without knowing their number up front.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Deferred action run once all events have fired
pub type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Pending {
    name: String,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct State {
    events: HashMap<u64, Pending>,
    next_id: u64,
    actions: Vec<Action>,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    default_timeout: Option<Duration>,
}

impl Inner {
    fn add(&self, id: u64, name: &str, deadline: Option<Instant>) {
        self.state.lock().events.insert(
            id,
            Pending {
                name: name.to_string(),
                deadline,
            },
        );
    }

    fn remove(&self, id: Option<u64>) {
        let actions = {
            let mut state = self.state.lock();
            if let Some(id) = id {
                state.events.remove(&id);
            }
            if !state.events.is_empty() {
                return;
            }
            std::mem::take(&mut state.actions)
        };
        run_actions(actions);
        self.cond.notify_all();
    }
}

// An action that fails or panics stops the rest
fn run_actions(actions: Vec<Action>) {
    for action in actions {
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "queued action failed, skipping the rest");
                return;
            }
            Err(_) => {
                debug!("queued action panicked, skipping the rest");
                return;
            }
        }
    }
}

/// Multi waiter barrier
#[derive(Clone)]
pub struct MultiEvent {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MultiEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiEvent")
            .field("waiting_for", &self.waiting_for())
            .finish()
    }
}

impl Default for MultiEvent {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MultiEvent {
    /// Create a barrier; events created without a timeout inherit `default_timeout`
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                cond: Condvar::new(),
                default_timeout: default_timeout.filter(|t| !t.is_zero()),
            }),
        }
    }

    /// Create a new pending event
    pub fn new_event(&self, timeout: Option<Duration>, name: &str) -> SingleEvent {
        let deadline = timeout
            .or(self.inner.default_timeout)
            .map(|t| Instant::now() + t);
        let id = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            state.next_id
        };
        self.inner.add(id, name, deadline);
        SingleEvent {
            inner: self.inner.clone(),
            id,
            name: name.to_string(),
            deadline,
        }
    }

    /// Create a new pending event and return a closure firing it
    pub fn get_trigger(&self, timeout: Option<Duration>, name: &str) -> impl FnOnce() + Send {
        let event = self.new_event(timeout, name);
        move || event.set()
    }

    /// Whether no event is pending
    pub fn is_set(&self) -> bool {
        self.inner.state.lock().events.is_empty()
    }

    /// Names of the pending events, sorted
    pub fn waiting_for(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .state
            .lock()
            .events
            .values()
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Run `action` once no event is pending (immediately if none is)
    pub fn queue(&self, action: Action) {
        self.inner.state.lock().actions.push(action);
        self.inner.remove(None);
    }

    /// Block until no event is pending
    ///
    /// Returns false when the earliest deadline of a pending event, or the
    /// given timeout, passes first.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let caller_deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            if state.events.is_empty() {
                return true;
            }
            let deadline = state
                .events
                .values()
                .filter_map(|e| e.deadline)
                .chain(caller_deadline)
                .min();
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.inner.cond.wait_until(&mut state, deadline);
                }
                None => self.inner.cond.wait(&mut state),
            }
        }
    }

    /// [`MultiEvent::wait`] from async code
    pub async fn wait_async(&self, timeout: Option<Duration>) -> bool {
        let barrier = self.clone();
        tokio::task::spawn_blocking(move || barrier.wait(timeout))
            .await
            .unwrap_or(false)
    }
}

/// One event of a [`MultiEvent`]
pub struct SingleEvent {
    inner: Arc<Inner>,
    id: u64,
    name: String,
    deadline: Option<Instant>,
}

impl std::fmt::Debug for SingleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleEvent")
            .field("name", &self.name)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl SingleEvent {
    /// Fire: the event is no longer pending
    pub fn set(&self) {
        self.inner.remove(Some(self.id));
    }

    /// Re-arm: the event is pending again
    pub fn clear(&self) {
        self.inner.add(self.id, &self.name, self.deadline);
    }

    /// Whether the event is still pending
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().events.contains_key(&self.id)
    }

    /// Event name
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_empty_is_satisfied() {
        let barrier = MultiEvent::default();
        assert!(barrier.is_set());
        assert!(barrier.wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_waits_for_all_events() {
        let barrier = MultiEvent::default();
        let a = barrier.new_event(None, "a");
        let b = barrier.new_event(None, "b");
        assert_eq!(barrier.waiting_for(), ["a", "b"]);

        let handle = thread::spawn(move || {
            a.set();
            thread::sleep(Duration::from_millis(20));
            b.set();
        });
        assert!(barrier.wait(Some(Duration::from_secs(5))));
        handle.join().unwrap();
        assert!(barrier.waiting_for().is_empty());
    }

    #[test]
    fn test_default_timeout_is_inherited() {
        let barrier = MultiEvent::new(Some(Duration::from_millis(30)));
        let _pending = barrier.new_event(None, "slow");
        let start = Instant::now();
        assert!(!barrier.wait(None));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_caller_timeout() {
        let barrier = MultiEvent::default();
        let event = barrier.new_event(None, "never");
        assert!(!barrier.wait(Some(Duration::from_millis(10))));
        event.set();
        assert!(barrier.wait(Some(Duration::from_millis(10))));
        event.clear();
        assert!(event.is_pending());
        assert!(!barrier.is_set());
    }

    #[test]
    fn test_queued_actions_run_when_done() {
        let barrier = MultiEvent::default();
        let count = Arc::new(AtomicUsize::new(0));
        let event = barrier.new_event(None, "x");

        let c = count.clone();
        barrier.queue(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        event.set();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // already satisfied: runs at once
        let c = count.clone();
        barrier.queue(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_action_stops_the_rest() {
        let barrier = MultiEvent::default();
        let count = Arc::new(AtomicUsize::new(0));
        let trigger = barrier.get_trigger(None, "x");
        barrier.queue(Box::new(|| -> anyhow::Result<()> { anyhow::bail!("broken") }));
        let c = count.clone();
        barrier.queue(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        trigger();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let barrier = MultiEvent::default();
        let trigger = barrier.get_trigger(None, "later");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger();
        });
        assert!(barrier.wait_async(Some(Duration::from_secs(5))).await);
    }

    #[test]
    fn test_wait_async_times_out() {
        let barrier = MultiEvent::default();
        let _pending = barrier.new_event(None, "never");
        let done = tokio_test::block_on(barrier.wait_async(Some(Duration::from_millis(20))));
        assert!(!done);
        assert_eq!(barrier.waiting_for(), ["never"]);
    }
}
