//! Router: one apparent node made of several upstream nodes
//!
//! Requests for upstream modules are forwarded verbatim and the reply is
//! relayed. Upstream update events go through the local subscription
//! logic. Module wise activation is not supported since the upstream
//! connections are always fully activated.

use crate::core::client::{ClientEvent, SecopClient};
use crate::core::codec::{split_specifier, Message};
use crate::core::dispatcher::{make_update, Dispatch, Dispatcher, Request};
use crate::core::errors::SecopError;
use crate::core::module::ParamValue;
use crate::core::multievent::MultiEvent;
use crate::core::protocol::Action;
use crate::core::transport::{Connection, ConnectionId};
use crate::utils::RecoveryPolicy;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time granted to all upstream nodes to connect at startup
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An upstream node as seen by the router
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Node address for logs
    fn name(&self) -> String;

    /// Whether the node is reachable
    fn is_online(&self) -> bool;

    /// Last descriptive data
    fn description(&self) -> Option<Value>;

    /// Cached parameter records
    fn cached(&self) -> Vec<(String, String, ParamValue)>;

    /// Forward a request and return the raw reply, error replies included
    async fn forward(&self, msg: Message) -> Result<Message, SecopError>;
}

#[async_trait]
impl Upstream for SecopClient {
    fn name(&self) -> String {
        self.uri().to_string()
    }

    fn is_online(&self) -> bool {
        SecopClient::is_online(self)
    }

    fn description(&self) -> Option<Value> {
        SecopClient::description(self)
    }

    fn cached(&self) -> Vec<(String, String, ParamValue)> {
        SecopClient::cached(self)
    }

    async fn forward(&self, msg: Message) -> Result<Message, SecopError> {
        self.exchange(msg).await
    }
}

type RestartHook = Box<dyn Fn() + Send + Sync>;

fn upstream_modules(description: Option<&Value>) -> Vec<String> {
    description
        .and_then(|d| d.get("modules"))
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

/// A dispatcher routing to upstream nodes
pub struct Router {
    local: Arc<Dispatcher>,
    upstreams: Vec<Arc<dyn Upstream>>,
    owners: RwLock<HashMap<String, usize>>,
    restart: RwLock<Option<RestartHook>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("upstreams", &self.upstreams.iter().map(|u| u.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router over `upstreams`; `local` keeps connections,
    /// subscriptions and any local modules
    pub fn new(local: Arc<Dispatcher>, upstreams: Vec<Arc<dyn Upstream>>) -> Arc<Self> {
        let router = Arc::new(Self {
            local,
            upstreams,
            owners: RwLock::new(HashMap::new()),
            restart: RwLock::new(None),
        });
        router.refresh_modules();
        router
    }

    /// Called when an upstream node changes its descriptive data
    pub fn on_restart(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.restart.write() = Some(Box::new(hook));
    }

    /// The dispatcher holding connections and local modules
    pub fn local(&self) -> &Arc<Dispatcher> {
        &self.local
    }

    /// Rebuild the module to node map; the first node naming a module wins
    pub fn refresh_modules(&self) {
        let mut owners = HashMap::new();
        for (idx, upstream) in self.upstreams.iter().enumerate() {
            for module in upstream_modules(upstream.description().as_ref()) {
                if self.local.has_module(&module) || owners.contains_key(&module) {
                    info!(module = %module, node = %upstream.name(), "module is already present");
                    continue;
                }
                owners.insert(module, idx);
            }
        }
        *self.owners.write() = owners;
    }

    fn owner(&self, module: &str) -> Option<&Arc<dyn Upstream>> {
        let idx = *self.owners.read().get(module)?;
        self.upstreams.get(idx)
    }

    /// Feed an event of upstream node `idx`
    pub fn on_event(&self, idx: usize, event: ClientEvent) {
        match event {
            ClientEvent::Update {
                module,
                param,
                record,
            } => self.local.broadcast_event(make_update(&module, &param, &record)),
            ClientEvent::Connected => {
                let known = self.owners.read().values().any(|&owner| owner == idx);
                if !known {
                    debug!(node = idx, "folding in node");
                    self.refresh_modules();
                }
            }
            ClientEvent::DescriptionChanged => {
                warn!(node = idx, "descriptive data of upstream node changed, restarting");
                if let Some(hook) = self.restart.read().as_ref() {
                    hook();
                }
            }
            ClientEvent::Disconnected => {}
        }
    }

    /// Forward the events of upstream node `idx` until its sender closes
    pub fn pump(self: &Arc<Self>, idx: usize, mut events: broadcast::Receiver<ClientEvent>) -> JoinHandle<()> {
        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match router.upgrade() {
                        Some(router) => router.on_event(idx, event),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(node = idx, skipped = n, "router lagging behind upstream events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Descriptive data of the routed node
    ///
    /// A router over exactly one node and no local modules passes that
    /// node's data through unchanged.
    pub fn descriptive_data(&self, specifier: Option<&str>) -> Result<Value, SecopError> {
        if let [single] = self.upstreams.as_slice() {
            if self.local.module_names().is_empty() {
                if let Some(description) = single.description() {
                    return Ok(description);
                }
            }
        }
        let spec = specifier.unwrap_or_default();
        let (module, accessible) = split_specifier(spec);
        if module.is_empty() || module == "." {
            return Ok(self.merged_description());
        }
        if self.local.has_module(module) {
            return self.local.descriptive_data(specifier);
        }
        let description = self
            .owner(module)
            .and_then(|u| u.description())
            .and_then(|d| d.get("modules").and_then(|m| m.get(module)).cloned())
            .ok_or_else(|| SecopError::no_such_module(module))?;
        match accessible {
            None | Some("") => Ok(description),
            Some(name) => description
                .get("accessibles")
                .and_then(|a| a.get(name))
                .cloned()
                .ok_or_else(|| SecopError::no_such_parameter(module, name)),
        }
    }

    fn merged_description(&self) -> Value {
        let mut modules = self.local.describe_modules();
        let mut sections = vec![self.local.node().description.clone()];
        for upstream in &self.upstreams {
            let Some(Value::Object(mut data)) = upstream.description() else {
                continue;
            };
            let node_modules = match data.remove("modules") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            };
            let equipment_id = data
                .remove("equipment_id")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            let description = data
                .remove("description")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            sections.push(format!("--- {equipment_id} ---\n{description}"));
            sections.push(
                data.iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            );
            for (name, module) in node_modules {
                if !modules.contains_key(&name) {
                    modules.insert(name, module);
                }
            }
        }
        self.local.node_description(modules, &sections.join("\n\n"))
    }

    async fn forward(&self, upstream: &Arc<dyn Upstream>, msg: Message) -> Result<Message, SecopError> {
        if !upstream.is_online() {
            return Err(SecopError::CommunicationFailed(format!(
                "remote SEC node {} disconnected",
                upstream.name()
            )));
        }
        upstream.forward(msg).await
    }

    fn activate(&self, conn: ConnectionId, msg: &Message) -> Result<Message, SecopError> {
        if msg.specifier.is_some() {
            return Err(SecopError::NotImplemented(
                "module wise activation not implemented".into(),
            ));
        }
        let reply = self.local.handle(conn, msg)?;
        for upstream in &self.upstreams {
            for (module, param, record) in upstream.cached() {
                self.local.send_to(conn, make_update(&module, &param, &record));
            }
        }
        Ok(reply)
    }
}

#[async_trait]
impl Dispatch for Router {
    fn add_connection(&self, conn: Connection) {
        self.local.add_connection(conn);
    }

    fn remove_connection(&self, id: ConnectionId) {
        self.local.remove_connection(id);
    }

    async fn handle_request(&self, conn: ConnectionId, msg: Message) -> Result<Message, SecopError> {
        let upstream = match Request::parse(&msg)? {
            Request::Describe(specifier) => {
                return Ok(Message::reply(
                    Action::Describe,
                    Some(specifier.unwrap_or(".")),
                    Some(self.descriptive_data(specifier)?),
                ));
            }
            Request::Activate(_) => return self.activate(conn, &msg),
            Request::Deactivate(Some(_)) => {
                return Err(SecopError::NotImplemented(
                    "module wise activation not implemented".into(),
                ))
            }
            Request::Read { module, .. } | Request::Change { module, .. } | Request::Do { module, .. }
                if !self.local.has_module(module) =>
            {
                self.owner(module).cloned()
            }
            _ => None,
        };
        match upstream {
            Some(upstream) => self.forward(&upstream, msg).await,
            None => self.local.handle(conn, &msg),
        }
    }
}

/// Connect all clients concurrently, waiting at most `timeout`
///
/// Every client then keeps reconnecting in the background; nodes that
/// were not reachable in time are folded in once they connect.
pub async fn start_upstreams(
    clients: &[SecopClient],
    timeout: Duration,
    policy: &RecoveryPolicy,
) -> Vec<JoinHandle<()>> {
    let started = MultiEvent::new(Some(timeout));
    for client in clients {
        let trigger = started.get_trigger(None, client.uri());
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.connect().await {
                warn!(node = %client.uri(), error = %e, "can not connect to node");
            }
            trigger();
        });
    }
    if !started.wait_async(Some(timeout)).await {
        warn!(waiting_for = ?started.waiting_for(), "upstream nodes not connected in time");
    }
    clients.iter().map(|c| c.spawn(policy.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::decode_line;
    use crate::core::datatype::DataType;
    use crate::core::dispatcher::NodeInfo;
    use crate::core::module::{Module, Parameter};
    use crate::core::transport::{bind_listener, serve_tcp, HandlerOptions};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::Receiver;
    use tokio_util::sync::CancellationToken;

    struct FakeNode {
        name: String,
        online: bool,
        description: Value,
        cache: Vec<(String, String, ParamValue)>,
        forwarded: Mutex<Vec<Message>>,
    }

    impl FakeNode {
        fn new(equipment_id: &str, modules: &[&str]) -> Arc<Self> {
            let modules: Map<String, Value> = modules
                .iter()
                .map(|m| (m.to_string(), json!({ "accessibles": { "value": { "readonly": true } } })))
                .collect();
            let cache = modules
                .keys()
                .map(|m| (m.clone(), "value".to_string(), ParamValue::new(json!(1.0), 5.0)))
                .collect();
            Arc::new(Self {
                name: equipment_id.to_string(),
                online: true,
                description: json!({
                    "equipment_id": equipment_id,
                    "description": format!("node {equipment_id}"),
                    "firmware": "fake",
                    "modules": modules,
                }),
                cache,
                forwarded: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Upstream for FakeNode {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn is_online(&self) -> bool {
            self.online
        }

        fn description(&self) -> Option<Value> {
            Some(self.description.clone())
        }

        fn cached(&self) -> Vec<(String, String, ParamValue)> {
            self.cache.clone()
        }

        async fn forward(&self, msg: Message) -> Result<Message, SecopError> {
            self.forwarded.lock().push(msg.clone());
            Ok(Message::new("reply", msg.specifier, Some(json!([42, {"t": 1.0}]))))
        }
    }

    fn connect(router: &Router) -> (ConnectionId, Receiver<Message>) {
        let (conn, rx) = Connection::channel("test");
        let id = conn.id();
        Dispatch::add_connection(router, conn);
        (id, rx)
    }

    async fn request(router: &Router, conn: ConnectionId, line: &str) -> Result<Message, SecopError> {
        router.handle_request(conn, decode_line(line).unwrap()).await
    }

    fn upstreams(nodes: &[&Arc<FakeNode>]) -> Vec<Arc<dyn Upstream>> {
        nodes.iter().map(|n| Arc::clone(n) as Arc<dyn Upstream>).collect()
    }

    fn local() -> Arc<Dispatcher> {
        Dispatcher::new(NodeInfo::new("router", "the router"))
    }

    #[tokio::test]
    async fn test_single_node_passes_description_through() {
        let node = FakeNode::new("up", &["x"]);
        let router = Router::new(local(), upstreams(&[&node]));
        let (conn, _rx) = connect(&router);
        let reply = request(&router, conn, "describe").await.unwrap();
        assert_eq!(reply.data.unwrap(), node.description);
    }

    #[tokio::test]
    async fn test_merged_description_first_seen_wins() {
        let a = FakeNode::new("a", &["x", "y"]);
        let b = FakeNode::new("b", &["y", "z"]);
        let router = Router::new(local(), upstreams(&[&a, &b]));
        let data = router.descriptive_data(None).unwrap();
        let modules: Vec<_> = data["modules"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(modules, ["x", "y", "z"]);
        let description = data["description"].as_str().unwrap();
        assert!(description.starts_with("the router"));
        assert!(description.contains("--- a ---\nnode a"));
        assert!(description.contains("--- b ---\nnode b"));
        assert_eq!(data["equipment_id"], json!("router"));

        let (conn, _rx) = connect(&router);
        request(&router, conn, "read y:value").await.unwrap();
        assert_eq!(a.forwarded.lock().len(), 1);
        assert!(b.forwarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_requests_are_forwarded_verbatim() {
        let node = FakeNode::new("up", &["x"]);
        let router = Router::new(local(), upstreams(&[&node]));
        let (conn, _rx) = connect(&router);
        let reply = request(&router, conn, "change x:target 3").await.unwrap();
        assert_eq!(reply.data.unwrap()[0], json!(42));
        assert_eq!(node.forwarded.lock()[0].to_string(), "change x:target 3");

        let err = request(&router, conn, "read q:value").await.unwrap_err();
        assert_eq!(err.kind(), "NoSuchModuleError");
        let pong = request(&router, conn, "ping 1").await.unwrap();
        assert_eq!(pong.action, "pong");
        assert_eq!(node.forwarded.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_node_fails_communication() {
        let mut node = FakeNode::new("up", &["x"]);
        Arc::get_mut(&mut node).unwrap().online = false;
        let router = Router::new(local(), upstreams(&[&node]));
        let (conn, _rx) = connect(&router);
        let err = request(&router, conn, "read x:value").await.unwrap_err();
        assert_eq!(err.kind(), "CommunicationFailedError");
    }

    #[tokio::test]
    async fn test_local_modules_take_precedence() {
        let dispatcher = local();
        let module = Module::builder("x")
            .parameter(Parameter::new("value", DataType::double(None)).initial(json!(9.0)))
            .build()
            .unwrap();
        dispatcher.register_module(Arc::new(module)).unwrap();
        let node = FakeNode::new("up", &["x"]);
        let router = Router::new(dispatcher, upstreams(&[&node]));
        let (conn, _rx) = connect(&router);
        let reply = request(&router, conn, "read x").await.unwrap();
        assert_eq!(reply.data.unwrap()[0], json!(9.0));
        assert!(node.forwarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_activate_replays_cache_before_reply() {
        let router = Router::new(
            local(),
            upstreams(&[&FakeNode::new("a", &["x"]), &FakeNode::new("b", &["z"])]),
        );
        let (conn, mut rx) = connect(&router);
        let reply = request(&router, conn, "activate").await.unwrap();
        assert_eq!(reply.to_string(), "active");
        let mut specs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            specs.push(msg.specifier.unwrap());
        }
        assert_eq!(specs, ["x:value", "z:value"]);

        for line in ["activate x", "deactivate x:value"] {
            let err = request(&router, conn, line).await.unwrap_err();
            assert_eq!(err.kind(), "NotImplementedError");
        }
    }

    #[tokio::test]
    async fn test_upstream_updates_reach_active_connections() {
        let router = Router::new(local(), upstreams(&[&FakeNode::new("a", &["x"])]));
        let (conn, mut rx) = connect(&router);
        request(&router, conn, "activate").await.unwrap();
        while rx.try_recv().is_ok() {}

        router.on_event(
            0,
            ClientEvent::Update {
                module: "x".into(),
                param: "value".into(),
                record: ParamValue::new(json!(2.0), 6.0),
            },
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.to_string(), "update x:value [2.0,{\"t\":6.0}]");
    }

    #[tokio::test]
    async fn test_description_change_requests_restart() {
        let router = Router::new(local(), upstreams(&[&FakeNode::new("a", &["x"])]));
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        router.on_restart(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        router.on_event(0, ClientEvent::DescriptionChanged);
        router.on_event(0, ClientEvent::Disconnected);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    async fn serve_node(port: u16) -> (Arc<Dispatcher>, CancellationToken) {
        let dispatcher = Dispatcher::new(NodeInfo::new("upstream", "late node"));
        let module = Module::builder("T")
            .parameter(Parameter::new("value", DataType::double(Some("K"))).initial(json!(1.5)))
            .build()
            .unwrap();
        dispatcher.register_module(Arc::new(module)).unwrap();
        let shutdown = CancellationToken::new();
        let listener = bind_listener(port, false, &shutdown).await.unwrap();
        tokio::spawn(serve_tcp(
            listener,
            dispatcher.clone(),
            HandlerOptions::default(),
            shutdown.clone(),
        ));
        (dispatcher, shutdown)
    }

    async fn until(what: &str, mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    async fn next_update(rx: &mut Receiver<Message>, expected: &str) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let msg = rx.recv().await.unwrap();
                if msg.to_string().starts_with(expected) {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {expected}"));
    }

    #[tokio::test]
    async fn test_late_upstream_is_folded_in_and_survives_restart() {
        let port = {
            let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let client = SecopClient::new(format!("127.0.0.1:{port}"));
        let router = Router::new(local(), vec![Arc::new(client.clone()) as Arc<dyn Upstream>]);
        let pump = router.pump(0, client.subscribe());
        let keepalive = client.spawn(RecoveryPolicy {
            max_attempts: 0,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        });
        let (conn, mut rx) = connect(&router);
        request(&router, conn, "activate").await.unwrap();
        let err = request(&router, conn, "read T:value").await.unwrap_err();
        assert_eq!(err.kind(), "NoSuchModuleError");

        let (upstream, shutdown) = serve_node(port).await;
        until("module T routed", || router.owners.read().contains_key("T")).await;
        let data = router.descriptive_data(None).unwrap();
        assert_eq!(data["equipment_id"], "upstream");
        let reply = request(&router, conn, "read T:value").await.unwrap();
        assert!(reply.to_string().starts_with("reply T:value [1.5,"));

        upstream.module("T").unwrap().set_parameter("value", &json!(2.5)).unwrap();
        next_update(&mut rx, "update T:value [2.5,").await;

        shutdown.cancel();
        next_update(&mut rx, "error_update T:value [\"CommunicationFailedError\"").await;
        let err = request(&router, conn, "read T:value").await.unwrap_err();
        assert_eq!(err.kind(), "CommunicationFailedError");

        let (upstream, shutdown) = serve_node(port).await;
        until("upstream back", || {
            client
                .cached_value("T", "value")
                .is_some_and(|r| r.error.is_none())
        })
        .await;
        assert!(router.owners.read().contains_key("T"));
        upstream.module("T").unwrap().set_parameter("value", &json!(3.5)).unwrap();
        next_update(&mut rx, "update T:value [3.5,").await;

        client.close();
        tokio::time::timeout(Duration::from_secs(5), keepalive).await.unwrap().unwrap();
        shutdown.cancel();
        pump.abort();
    }
}
