//! Background poll scheduler
//!
//! Parameters are kept fresh by one poller thread per poll group. Each poll
//! class has its own priority queue ordered by due time:
//!
//! - SLOW: every `4 * pollinterval`, lowest priority
//! - REGULAR: every `pollinterval`
//! - DYNAMIC: every `pollinterval`, or every `pollinterval / 4` while the
//!   module is busy
//!
//! When more polls are due than time permits, at least every second poll is
//! a dynamic one, and one slow poll is done after every `n` regular polls,
//! where `n` is the number of regular items.

use crate::core::errors::SecopError;
use crate::core::module::Module;
use crate::utils::now;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time allowed for the first sweep of a poller
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for the wait after a poll before the item is checked again
pub const MAX_POLL_TEST_PERIOD: f64 = 10.0;

/// Upper bound for any idle wait
const MAX_WAIT: f64 = 3600.0;

/// Poll class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PollType {
    /// Low priority, slower cadence
    Slow,
    /// Standard cadence
    Regular,
    /// Faster cadence while busy
    Dynamic,
}

impl PollType {
    /// All classes, in startup order
    pub fn all() -> &'static [PollType] {
        &[PollType::Slow, PollType::Regular, PollType::Dynamic]
    }

    /// Cadence multiplier relative to the module poll interval
    pub fn factor(&self) -> f64 {
        match self {
            PollType::Slow => 4.0,
            PollType::Regular => 1.0,
            PollType::Dynamic => 0.25,
        }
    }

    fn index(self) -> usize {
        match self {
            PollType::Slow => 0,
            PollType::Regular => 1,
            PollType::Dynamic => 2,
        }
    }
}

/// What a poller needs from a module
pub trait Pollable: Send + Sync {
    /// Module name for logs
    fn name(&self) -> &str;

    /// Base poll interval in seconds
    fn pollinterval(&self) -> f64;

    /// Whether the module is busy
    fn is_busy(&self) -> bool;

    /// Timestamp of the last update of a parameter
    fn timestamp(&self, param: &str) -> Option<f64>;

    /// Read one parameter, caching and announcing the result
    fn poll_param(&self, param: &str) -> Result<(), SecopError>;

    /// Parameters to poll and their class
    fn poll_items(&self) -> Vec<(String, PollType)>;
}

impl Pollable for Module {
    fn name(&self) -> &str {
        Module::name(self)
    }

    fn pollinterval(&self) -> f64 {
        Module::pollinterval(self)
    }

    fn is_busy(&self) -> bool {
        Module::is_busy(self)
    }

    fn timestamp(&self, param: &str) -> Option<f64> {
        self.record(param).and_then(|r| r.timestamp)
    }

    fn poll_param(&self, param: &str) -> Result<(), SecopError> {
        Module::poll_param(self, param)
    }

    fn poll_items(&self) -> Vec<(String, PollType)> {
        self.parameters()
            .iter()
            .filter_map(|p| p.poll_type().map(|t| (p.name.clone(), t)))
            .collect()
    }
}

struct PollItem {
    due: f64,
    lastdue: f64,
    idx: usize,
    module: Arc<dyn Pollable>,
    param: String,
    factor: f64,
}

impl PollItem {
    fn key(&self) -> (f64, f64, usize) {
        (self.due, self.lastdue, self.idx)
    }
}

impl PartialEq for PollItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PollItem {}

impl PartialOrd for PollItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PollItem {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.key(), other.key());
        a.0.total_cmp(&b.0)
            .then(a.1.total_cmp(&b.1))
            .then(a.2.cmp(&b.2))
    }
}

type Queue = BinaryHeap<Reverse<PollItem>>;

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    trigger: AtomicBool,
    cond: Condvar,
}

impl Signal {
    fn wait(&self, timeout: Duration) {
        let mut stopped = self.stopped.lock();
        if !*stopped && !self.trigger.load(AtomicOrdering::SeqCst) {
            self.cond.wait_for(&mut stopped, timeout);
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

/// Control handle of a running poller
#[derive(Clone)]
pub struct PollerHandle {
    name: String,
    signal: Arc<Signal>,
}

impl PollerHandle {
    /// Poller (group) name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop polling
    pub fn stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.cond.notify_all();
    }

    /// Poll every item as soon as possible, e.g. after a reconnect
    pub fn trigger_all(&self) {
        self.signal.trigger.store(true, AtomicOrdering::SeqCst);
        self.signal.cond.notify_all();
    }
}

/// Poller for one poll group
pub struct Poller {
    name: String,
    queues: [Queue; 3],
    maxwait: f64,
    startup_timeout: Duration,
    signal: Arc<Signal>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("items", &self.len())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Create an empty poller
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queues: [Queue::new(), Queue::new(), Queue::new()],
            maxwait: MAX_WAIT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            signal: Arc::new(Signal::default()),
        }
    }

    /// Poller name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time allowed for the first sweep
    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    /// Change the time allowed for the first sweep
    pub fn set_startup_timeout(&mut self, timeout: Duration) {
        self.startup_timeout = timeout;
    }

    /// Handle for stopping and triggering
    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            name: self.name.clone(),
            signal: self.signal.clone(),
        }
    }

    /// Number of poll items
    pub fn len(&self) -> usize {
        self.queues.iter().map(BinaryHeap::len).sum()
    }

    /// Whether there is nothing to poll
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add the pollable parameters of a module
    pub fn add_module(&mut self, module: Arc<dyn Pollable>) {
        self.maxwait = self.maxwait.min(MAX_POLL_TEST_PERIOD);
        for (param, polltype) in module.poll_items() {
            let queue = &mut self.queues[polltype.index()];
            let idx = queue.len();
            queue.push(Reverse(PollItem {
                due: 0.0,
                lastdue: 0.0,
                idx,
                module: module.clone(),
                param,
                factor: polltype.factor(),
            }));
        }
    }

    fn poll(&self, item: &PollItem) {
        if let Err(e) = item.module.poll_param(&item.param) {
            debug!(
                poller = %self.name,
                module = item.module.name(),
                param = %item.param,
                error = %e,
                "poll failed"
            );
        }
    }

    /// Poll every item once, slow items first, and seed the due times
    pub fn startup_sweep(&mut self) {
        self.startup_sweep_with(now);
    }

    fn startup_sweep_with(&mut self, clock: impl Fn() -> f64) {
        for polltype in PollType::all() {
            let queue = std::mem::take(&mut self.queues[polltype.index()]);
            let mut items: Vec<_> = queue.into_iter().map(|Reverse(item)| item).collect();
            items.sort_by_key(|item| item.idx);
            for item in &mut items {
                item.lastdue = clock();
                self.poll(item);
                item.due = item.lastdue + self.maxwait.min(item.module.pollinterval() * item.factor);
            }
            self.queues[polltype.index()] = items.into_iter().map(Reverse).collect();
        }
    }

    /// Mark every item due now
    pub fn trigger_all(&mut self) {
        for queue in &mut self.queues {
            let items = std::mem::take(queue);
            *queue = items
                .into_iter()
                .map(|Reverse(mut item)| {
                    item.due = 0.0;
                    Reverse(item)
                })
                .collect();
        }
    }

    /// Poll the next due item of a class
    ///
    /// Returns 0 after polling, the next due time when nothing is due yet,
    /// or infinity for an empty class.
    pub fn poll_next(&mut self, polltype: PollType) -> f64 {
        self.poll_next_at(polltype, now())
    }

    fn poll_next_at(&mut self, polltype: PollType, now: f64) -> f64 {
        let maxwait = self.maxwait;
        loop {
            let queue = &mut self.queues[polltype.index()];
            match queue.peek() {
                None => return f64::INFINITY,
                Some(Reverse(head)) if now < head.due => return head.due,
                Some(_) => {}
            }
            let Some(Reverse(mut item)) = queue.pop() else {
                return f64::INFINITY;
            };
            let pollinterval = item.module.pollinterval();
            let (interval, mininterval) = if polltype == PollType::Dynamic && !item.module.is_busy() {
                (pollinterval, pollinterval * item.factor)
            } else {
                let interval = pollinterval * item.factor;
                (interval, interval)
            };
            let due = if item.due == 0.0 {
                now
            } else {
                let updated = item.module.timestamp(&item.param).unwrap_or(0.0);
                (item.lastdue + interval).max(updated + interval * 0.5)
            };
            let polled = now >= due;
            if polled {
                self.poll(&item);
                item.lastdue = due;
                item.due = (due + mininterval).max(now + maxwait.min(mininterval * 0.5));
            } else {
                item.due = due;
            }
            self.queues[polltype.index()].push(Reverse(item));
            if polled {
                return 0.0;
            }
        }
    }

    /// Poll loop; `started` is called after the first sweep
    pub fn run(mut self, started: impl FnOnce()) {
        if self.is_empty() {
            started();
            return;
        }
        self.startup_sweep();
        started();
        debug!(poller = %self.name, items = self.len(), "poller started");

        let nregular = self.queues[PollType::Regular.index()].len();
        while !self.signal.is_stopped() {
            if self.signal.trigger.swap(false, AtomicOrdering::SeqCst) {
                self.trigger_all();
            }
            let mut due = f64::INFINITY;
            for _ in 0..nregular {
                due = self
                    .poll_next(PollType::Dynamic)
                    .min(self.poll_next(PollType::Regular));
                if due != 0.0 {
                    break;
                }
            }
            due = due
                .min(self.poll_next(PollType::Dynamic))
                .min(self.poll_next(PollType::Slow));
            let delay = due - now();
            if delay > 0.0 {
                self.signal.wait(Duration::from_secs_f64(delay.min(MAX_WAIT)));
            }
        }
        debug!(poller = %self.name, "poller stopped");
    }

    /// Run on a new thread
    pub fn spawn(
        self,
        started: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<(PollerHandle, thread::JoinHandle<()>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(format!("poll-{}", self.name))
            .spawn(move || self.run(started))?;
        Ok((handle, join))
    }
}

/// One poller per poll group, in group name order; groups without
/// pollable parameters are left out
pub fn build_pollers<'a>(modules: impl IntoIterator<Item = &'a Arc<Module>>) -> Vec<Poller> {
    let mut table: BTreeMap<String, Poller> = BTreeMap::new();
    for module in modules {
        let group = module.poll_group().to_string();
        let poller = table
            .entry(group.clone())
            .or_insert_with(|| Poller::new(group));
        let pollable: Arc<dyn Pollable> = module.clone();
        poller.add_module(pollable);
    }
    table
        .into_values()
        .filter(|p| {
            if p.is_empty() {
                warn!(poller = %p.name, "nothing to poll");
            }
            !p.is_empty()
        })
        .collect()
}
