//! Server orchestration
//!
//! Builds the dispatcher (or router) from a configuration, starts the
//! interfaces, the pollers and the discovery responder, and tears all of
//! it down again on shutdown or restart.

use crate::config::NodeConfig;
use crate::core::client::SecopClient;
use crate::core::discovery::{Advertisement, Discovery, UDP_PORT};
use crate::core::dispatcher::{Dispatch, Dispatcher, FIRMWARE};
use crate::core::multievent::MultiEvent;
use crate::core::poller::{build_pollers, PollerHandle};
use crate::core::router::{start_upstreams, Router, Upstream, CONNECT_TIMEOUT};
use crate::core::transport::{run_interface, Interface, Scheme};
use crate::utils::RecoveryPolicy;
use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Time granted to all interfaces to start listening
pub const INTERFACE_STARTUP_TIMEOUT: Duration = Duration::from_secs(12);

struct ControlState {
    run: Mutex<CancellationToken>,
    restart: AtomicBool,
    shutdown: AtomicBool,
}

/// Restart or shut down a running server from anywhere
#[derive(Clone)]
pub struct ServerControl {
    state: Arc<ControlState>,
}

impl std::fmt::Debug for ServerControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerControl")
            .field("restart", &self.state.restart.load(Ordering::SeqCst))
            .field("shutdown", &self.state.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    /// Create a control for one server
    pub fn new() -> Self {
        Self {
            state: Arc::new(ControlState {
                run: Mutex::new(CancellationToken::new()),
                restart: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Stop the current run and start again from the configuration
    pub fn restart(&self) {
        info!("restart requested");
        self.state.restart.store(true, Ordering::SeqCst);
        self.state.run.lock().cancel();
    }

    /// Stop the server
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.run.lock().cancel();
    }

    /// Whether a shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    // Fresh token for the next run
    fn next_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.state.run.lock() = token.clone();
        if self.is_shutdown() {
            token.cancel();
        }
        token
    }

    fn take_restart(&self) -> bool {
        self.state.restart.swap(false, Ordering::SeqCst)
    }
}

/// A started node
pub struct RunningNode {
    dispatch: Arc<dyn Dispatch>,
    dispatcher: Arc<Dispatcher>,
    router: Option<Arc<Router>>,
    ports: Vec<(Interface, u16)>,
    token: CancellationToken,
    pollers: Vec<PollerHandle>,
    poll_threads: Vec<thread::JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    clients: Vec<SecopClient>,
}

impl std::fmt::Debug for RunningNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningNode")
            .field("ports", &self.ports)
            .field("pollers", &self.pollers.len())
            .field("upstreams", &self.clients.len())
            .finish_non_exhaustive()
    }
}

impl RunningNode {
    /// Request entry point of the node
    pub fn dispatch(&self) -> &Arc<dyn Dispatch> {
        &self.dispatch
    }

    /// Dispatcher holding connections and local modules
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Router, when the node routes
    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    /// Interfaces that started, with their bound ports
    pub fn ports(&self) -> &[(Interface, u16)] {
        &self.ports
    }

    /// Bound port of the first interface of `scheme`
    pub fn port(&self, scheme: Scheme) -> Option<u16> {
        self.ports
            .iter()
            .find(|(i, _)| i.scheme == scheme)
            .map(|(_, p)| *p)
    }

    /// Stop interfaces, connections, pollers and upstream clients
    pub async fn stop(self) {
        self.token.cancel();
        for poller in &self.pollers {
            poller.stop();
        }
        for client in &self.clients {
            client.close();
        }
        for task in self.tasks {
            task.await.ok();
        }
        let threads = self.poll_threads;
        tokio::task::spawn_blocking(move || {
            for thread in threads {
                thread.join().ok();
            }
        })
        .await
        .ok();
        info!("node stopped");
    }
}

/// Start a node from `config`; `control` receives restart requests of
/// the router
///
/// Startup failures are collected; the node fails only when no
/// interface could be started.
pub async fn start(config: &NodeConfig, control: &ServerControl) -> anyhow::Result<RunningNode> {
    let token = CancellationToken::new();
    let dispatcher = Dispatcher::new(config.node_info());
    let modules: Vec<_> = config
        .build_modules()
        .context("building modules")?
        .into_iter()
        .map(Arc::new)
        .collect();
    for module in &modules {
        dispatcher.register_module(module.clone())?;
    }

    let mut tasks = Vec::new();
    let mut clients = Vec::new();
    let mut router = None;
    let dispatch: Arc<dyn Dispatch> = match &config.router {
        Some(section) => {
            clients = section.uris()?.into_iter().map(SecopClient::new).collect();
            tasks.extend(start_upstreams(&clients, CONNECT_TIMEOUT, &RecoveryPolicy::default()).await);
            let upstreams = clients
                .iter()
                .map(|c| Arc::new(c.clone()) as Arc<dyn Upstream>)
                .collect();
            let routed = Router::new(dispatcher.clone(), upstreams);
            let restart = control.clone();
            routed.on_restart(move || restart.restart());
            for (idx, client) in clients.iter().enumerate() {
                tasks.push(routed.pump(idx, client.subscribe()));
            }
            router = Some(routed.clone());
            routed as Arc<dyn Dispatch>
        }
        None => dispatcher.clone() as Arc<dyn Dispatch>,
    };

    let mut failures = Vec::new();
    let ports = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let interfaces_started = MultiEvent::new(Some(INTERFACE_STARTUP_TIMEOUT));
    for interface in config.node.interfaces.iter().copied() {
        let event = Arc::new(interfaces_started.new_event(None, &interface.to_string()));
        let (ports, errors, started) = (ports.clone(), errors.clone(), event.clone());
        let (dispatch, token) = (dispatch.clone(), token.clone());
        let (ipv6, options) = (config.node.ipv6, config.handler_options());
        tasks.push(tokio::spawn(async move {
            let result = run_interface(interface, ipv6, dispatch, options, token, move |port| {
                info!(%interface, port, "interface started");
                ports.lock().push((interface, port));
                started.set();
            })
            .await;
            if let Err(e) = result {
                error!(%interface, error = %e, "interface failed");
                errors.lock().push(format!("{interface}: {e}"));
                event.set();
            }
        }));
    }
    if !interfaces_started.wait_async(None).await {
        failures.push(format!(
            "interfaces not started in time: {}",
            interfaces_started.waiting_for().join(", ")
        ));
    }
    failures.extend(errors.lock().drain(..));
    let ports = ports.lock().clone();

    let mut pollers = Vec::new();
    let mut poll_threads = Vec::new();
    let startup_timeout = Duration::from_secs_f64(config.node.startup_timeout.max(0.0));
    let modules_started = MultiEvent::default();
    for mut poller in build_pollers(&modules) {
        poller.set_startup_timeout(startup_timeout);
        let trigger = modules_started.get_trigger(Some(poller.startup_timeout()), poller.name());
        let name = poller.name().to_string();
        match poller.spawn(trigger) {
            Ok((handle, join)) => {
                pollers.push(handle);
                poll_threads.push(join);
            }
            Err(e) => failures.push(format!("poller {name}: {e}")),
        }
    }
    if !modules_started.wait_async(None).await {
        for name in modules_started.waiting_for() {
            warn!(poller = %name, "first poll not finished in time");
        }
    }

    if config.node.discovery {
        match start_discovery(config, &ports, &token).await {
            Ok(Some(task)) => tasks.push(task),
            Ok(None) => {}
            Err(e) => failures.push(format!("discovery: {e:#}")),
        }
    }

    let node = RunningNode {
        dispatch,
        dispatcher,
        router,
        ports,
        token,
        pollers,
        poll_threads,
        tasks,
        clients,
    };
    if node.ports.is_empty() {
        node.stop().await;
        bail!("no interface started: {}", failures.join("; "));
    }
    for failure in &failures {
        warn!(%failure, "startup problem");
    }
    info!(
        equipment_id = %config.node.equipment_id,
        interfaces = node.ports.len(),
        problems = failures.len(),
        "node started"
    );
    Ok(node)
}

async fn start_discovery(
    config: &NodeConfig,
    ports: &[(Interface, u16)],
    token: &CancellationToken,
) -> anyhow::Result<Option<JoinHandle<()>>> {
    let Some(advert) = Advertisement::new(&config.node.equipment_id, FIRMWARE, &config.node.description) else {
        warn!("equipment id and firmware exceed the UDP limit, not answering discovery");
        return Ok(None);
    };
    let tcp_ports = ports
        .iter()
        .filter(|(i, _)| i.scheme == Scheme::Tcp)
        .map(|(_, p)| *p)
        .collect();
    let discovery = Discovery::bind(UDP_PORT, advert, tcp_ports).await?;
    discovery.broadcast(UDP_PORT).await;
    Ok(Some(tokio::spawn(discovery.run(token.clone()))))
}

/// Run a node until shut down, rebuilding it on every restart request
///
/// With a `path` the configuration is read again before each restart.
pub async fn serve(config: NodeConfig, path: Option<PathBuf>, control: ServerControl) -> anyhow::Result<()> {
    let mut config = config;
    loop {
        let run = control.next_run();
        if run.is_cancelled() {
            return Ok(());
        }
        let node = start(&config, &control).await?;
        run.cancelled().await;
        node.stop().await;
        if !control.take_restart() || control.is_shutdown() {
            return Ok(());
        }
        if let Some(path) = &path {
            match NodeConfig::load(path) {
                Ok(reloaded) => config = reloaded,
                Err(e) => error!(error = %e, "keeping previous configuration"),
            }
        }
        info!("restarting node");
    }
}
