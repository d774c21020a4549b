//! Cooperative state machine for device control loops
//!
//! A state is a plain function over the machine. It returns the next state,
//! asks to be called again later ([`Step::Retry`]) or finishes. The machine
//! carries a typed context `C` holding whatever the states need.
//!
//! [`StateMachine::start`] and [`StateMachine::stop`] never interrupt a state
//! function midway: the request is picked up before the next state call, the
//! cleanup function runs with the reason, and only then the new state (or
//! idle) takes over. Cleanup may return a state to recover into.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Maximum number of immediate transitions in one cycle
pub const MAX_CHAINED_STATES: usize = 1000;

/// Delay used for a [`Step::Retry`] without explicit delay
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Body of a state
pub type StateFn<C> = fn(&mut StateMachine<C>) -> anyhow::Result<Step<C>>;

/// Cleanup function, called with [`StateMachine::cleanup_reason`] set
pub type CleanupFn<C> = fn(&mut StateMachine<C>) -> anyhow::Result<Option<State<C>>>;

/// Attribute update applied on start
pub type Attrs<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Named state
pub struct State<C> {
    /// Name used in logs
    pub name: &'static str,
    /// State body
    pub run: StateFn<C>,
}

impl<C> State<C> {
    /// Create a state
    pub const fn new(name: &'static str, run: StateFn<C>) -> Self {
        Self { name, run }
    }
}

impl<C> Clone for State<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for State<C> {}

impl<C> fmt::Debug for State<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Result of one state call
pub enum Step<C> {
    /// Transition immediately
    Next(State<C>),
    /// Call the same state again after the delay
    Retry(Option<Duration>),
    /// Go idle
    Finish,
}

/// Why the cleanup function is called
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReason {
    /// A state function failed
    Error(String),
    /// `start` was called with a new state
    Restarted(&'static str),
    /// `stop` was called
    Stopped,
}

enum Task<C> {
    Start {
        state: State<C>,
        cleanup: Option<CleanupFn<C>>,
        attrs: Option<Attrs<C>>,
    },
    Stop,
    Quit,
}

enum Chain {
    Retry(Option<Duration>),
    Done,
    Recovered,
}

/// Handle to post start/stop requests to a machine running on another thread
pub struct StateMachineHandle<C> {
    tx: Sender<Task<C>>,
}

impl<C> Clone for StateMachineHandle<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> StateMachineHandle<C> {
    /// Restart with `state`
    pub fn start(&self, state: State<C>, cleanup: Option<CleanupFn<C>>) {
        let _ = self.tx.send(Task::Start {
            state,
            cleanup,
            attrs: None,
        });
    }

    /// Restart with `state`, applying `attrs` to the context first
    pub fn start_with(
        &self,
        state: State<C>,
        cleanup: Option<CleanupFn<C>>,
        attrs: impl FnOnce(&mut C) + Send + 'static,
    ) {
        let _ = self.tx.send(Task::Start {
            state,
            cleanup,
            attrs: Some(Box::new(attrs)),
        });
    }

    /// Stop and go idle
    pub fn stop(&self) {
        let _ = self.tx.send(Task::Stop);
    }

    /// Stop the runner thread
    pub fn quit(&self) {
        let _ = self.tx.send(Task::Quit);
    }
}

/// The state machine
pub struct StateMachine<C> {
    /// State context
    pub ctx: C,
    /// True only in the first call of a state after a transition
    pub init: bool,
    /// Time of the current state call
    pub now: Instant,
    statefunc: Option<State<C>>,
    cleanup: Option<CleanupFn<C>>,
    next_task: Option<Task<C>>,
    cleanup_reason: Option<CleanupReason>,
    last_error: Option<String>,
    last_time: Instant,
    start_time: Instant,
    max_chained: usize,
    quit: bool,
    tx: Sender<Task<C>>,
    rx: Receiver<Task<C>>,
}

impl<C> StateMachine<C> {
    /// Create an idle machine
    pub fn new(ctx: C) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let now = Instant::now();
        Self {
            ctx,
            init: true,
            now,
            statefunc: None,
            cleanup: None,
            next_task: None,
            cleanup_reason: None,
            last_error: None,
            last_time: now,
            start_time: now,
            max_chained: MAX_CHAINED_STATES,
            quit: false,
            tx,
            rx,
        }
    }

    /// Handle for other threads
    pub fn handle(&self) -> StateMachineHandle<C> {
        StateMachineHandle {
            tx: self.tx.clone(),
        }
    }

    /// Request a (re)start; takes effect on the next cycle
    pub fn start(&mut self, state: State<C>, cleanup: Option<CleanupFn<C>>) {
        self.next_task = Some(Task::Start {
            state,
            cleanup,
            attrs: None,
        });
    }

    /// Request a stop; takes effect on the next cycle
    pub fn stop(&mut self) {
        self.next_task = Some(Task::Stop);
    }

    /// Whether a state is running
    pub fn is_active(&self) -> bool {
        self.statefunc.is_some()
    }

    /// Name of the current state
    pub fn state_name(&self) -> Option<&'static str> {
        self.statefunc.map(|s| s.name)
    }

    /// Reason passed to the running cleanup
    pub fn cleanup_reason(&self) -> Option<&CleanupReason> {
        self.cleanup_reason.as_ref()
    }

    /// Last error raised by a state
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Time since the machine was last started
    pub fn elapsed(&self) -> Duration {
        self.now.saturating_duration_since(self.start_time)
    }

    /// Seconds since the last transition or the last successful `delta` call
    ///
    /// Returns `None` while less than `mindelta` has passed.
    pub fn delta(&mut self, mindelta: f64) -> Option<f64> {
        let delta = self.now.saturating_duration_since(self.last_time).as_secs_f64();
        if delta < mindelta {
            return None;
        }
        self.last_time = self.now;
        Some(delta)
    }

    fn new_state(&mut self, state: Option<State<C>>) {
        self.init = true;
        self.statefunc = state;
        self.last_time = self.now;
    }

    fn accept(&mut self, task: Task<C>) {
        if matches!(task, Task::Quit) {
            self.quit = true;
        } else {
            self.next_task = Some(task);
        }
    }

    fn run_cleanup(&mut self, reason: CleanupReason) -> Option<State<C>> {
        let name = self.state_name().unwrap_or("<idle>");
        match &reason {
            CleanupReason::Error(e) => {
                warn!(state = name, error = %e, "state raised");
                self.last_error = Some(e.clone());
            }
            CleanupReason::Stopped => debug!(state = name, "stopped"),
            CleanupReason::Restarted(next) => debug!(state = name, next, "restart"),
        }
        if self.cleanup_reason.is_none() {
            self.cleanup_reason = Some(reason);
        }
        let cleanup = self.cleanup.take()?;
        match cleanup(self) {
            Ok(next) => next,
            Err(e) => {
                error!(state = name, error = %e, "cleanup raised");
                None
            }
        }
    }

    fn run_chain(&mut self) -> Chain {
        for _ in 0..self.max_chained {
            self.now = Instant::now();
            let interrupt = match (&self.next_task, &self.cleanup_reason) {
                (Some(Task::Stop), None) => Some(CleanupReason::Stopped),
                (Some(Task::Start { state, .. }), None) => Some(CleanupReason::Restarted(state.name)),
                _ => None,
            };
            let next = if let Some(reason) = interrupt {
                self.run_cleanup(reason)
            } else {
                let Some(state) = self.statefunc else {
                    return Chain::Done;
                };
                match (state.run)(self) {
                    Ok(Step::Retry(delay)) => {
                        self.init = false;
                        return Chain::Retry(delay);
                    }
                    Ok(Step::Finish) => {
                        self.init = false;
                        return Chain::Done;
                    }
                    Ok(Step::Next(next)) => Some(next),
                    Err(e) => self.run_cleanup(CleanupReason::Error(format!("{e:#}"))),
                }
            };
            match next {
                Some(next) => self.new_state(Some(next)),
                None => return Chain::Done,
            }
        }
        let name = self.state_name().unwrap_or("<idle>");
        let reason = CleanupReason::Error(format!(
            "{name}: too many states chained - probably infinite loop"
        ));
        match self.run_cleanup(reason) {
            Some(next) => {
                self.new_state(Some(next));
                Chain::Recovered
            }
            None => Chain::Done,
        }
    }

    /// Run state functions until one retries, the machine goes idle or a
    /// pending start request has been served
    ///
    /// Returns the delay until the next cycle, or `None` when idle.
    pub fn cycle(&mut self) -> Option<Duration> {
        while let Ok(task) = self.rx.try_recv() {
            self.accept(task);
        }
        for _ in 0..2 {
            if self.statefunc.is_some() {
                match self.run_chain() {
                    Chain::Retry(delay) => return Some(delay.unwrap_or(DEFAULT_RETRY_DELAY)),
                    Chain::Recovered => continue,
                    Chain::Done => {
                        if self.cleanup_reason.is_none() {
                            debug!(state = self.state_name().unwrap_or("<idle>"), "finish");
                        }
                        self.new_state(None);
                    }
                }
            }
            if let Some(task) = self.next_task.take() {
                self.cleanup_reason = None;
                if let Task::Start {
                    state,
                    cleanup,
                    attrs,
                } = task
                {
                    if let Some(attrs) = attrs {
                        attrs(&mut self.ctx);
                    }
                    self.cleanup = cleanup;
                    self.start_time = Instant::now();
                    self.new_state(Some(state));
                }
            }
        }
        self.statefunc.map(|_| Duration::ZERO)
    }
}

impl<C: Send + 'static> StateMachine<C> {
    /// Run the machine on its own thread, driven by handle requests
    pub fn spawn(self, name: &str) -> std::io::Result<(StateMachineHandle<C>, thread::JoinHandle<C>)> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    /// Runner loop; returns the context after [`StateMachineHandle::quit`]
    pub fn run(mut self) -> C {
        loop {
            let wait = self.cycle();
            if self.quit {
                break;
            }
            let received = match wait {
                Some(delay) => match self.rx.recv_timeout(delay) {
                    Ok(task) => Some(task),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(task) => Some(task),
                    Err(_) => break,
                },
            };
            if let Some(task) = received {
                self.accept(task);
            }
        }
        self.ctx
    }
}
