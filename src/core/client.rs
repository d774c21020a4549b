//! Client for an upstream SEC node
//!
//! Keeps one TCP connection to a node, matches replies to requests by
//! (request action, specifier) and mirrors every parameter of the node in
//! a cache fed by its update events. When the connection drops, every
//! cached value turns into a `CommunicationFailedError` record and the
//! client reconnects in the background.

use crate::core::codec::{Message, SecopCodec};
use crate::core::errors::SecopError;
use crate::core::module::ParamValue;
use crate::core::protocol::{Action, EVENT_REPLY, IDENT_PREFIX, IDENT_REQUEST};
use crate::utils::{now, RecoveryPolicy};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Legacy identification prefix still accepted from old nodes
pub const LEGACY_IDENT_PREFIX: &str = "SECoP,";

/// Default time to wait for a reply
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time to wait for the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on the upstream connection
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established and cache filled
    Connected,
    /// Connection lost
    Disconnected,
    /// A cached value changed
    Update {
        /// Module name
        module: String,
        /// Parameter name
        param: String,
        /// New record
        record: ParamValue,
    },
    /// The descriptive data differs from the one seen before
    DescriptionChanged,
}

type ReplyKey = (String, Option<String>);
type ReplySender = oneshot::Sender<Message>;

#[derive(Default)]
struct Session {
    // bumped on every connect; readers of older sockets are ignored
    generation: u64,
    writer: Option<mpsc::UnboundedSender<Message>>,
    pending: HashMap<ReplyKey, ReplySender>,
    identification: Option<String>,
    description: Option<Value>,
}

struct Inner {
    uri: String,
    session: Mutex<Session>,
    cache: RwLock<BTreeMap<(String, String), ParamValue>>,
    // one lock per reply key, so colliding requests wait for each other
    request_locks: Mutex<HashMap<ReplyKey, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ClientEvent>,
    disconnected: Notify,
    shutdown: CancellationToken,
    timeout: Duration,
}

/// Key a reply is matched with: the request action and its specifier
fn reply_key(msg: &Message) -> Option<ReplyKey> {
    let action = Action::from_reply(&msg.action)?;
    let specifier = match action {
        Action::Identify | Action::Describe | Action::Deactivate | Action::Help => None,
        _ => msg.specifier.clone(),
    };
    Some((action.request().to_string(), specifier))
}

fn request_key(msg: &Message) -> ReplyKey {
    let specifier = match Action::from_request(&msg.action) {
        Some(Action::Identify | Action::Describe | Action::Deactivate | Action::Help) => None,
        _ => msg.specifier.clone(),
    };
    (msg.action.clone(), specifier)
}

/// Turn an `error_<action>` reply into the error it reports
pub fn reply_error(msg: &Message) -> SecopError {
    let data = msg.data.as_ref();
    let kind = data.and_then(|d| d.get(0)).and_then(Value::as_str).unwrap_or("Internal");
    let text = data
        .and_then(|d| d.get(1))
        .and_then(Value::as_str)
        .unwrap_or_default();
    SecopError::from_report(kind, text)
}

/// Decode the data of an update or reply into a cache record
pub fn record_from_report(is_error: bool, data: &Value) -> ParamValue {
    let timestamp = data
        .get(if is_error { 2 } else { 1 })
        .and_then(|q| q.get("t"))
        .and_then(Value::as_f64);
    if is_error {
        let kind = data.get(0).and_then(Value::as_str).unwrap_or("Internal");
        let text = data.get(1).and_then(Value::as_str).unwrap_or_default();
        return ParamValue {
            value: Value::Null,
            timestamp,
            error: Some(SecopError::from_report(kind, text)),
        };
    }
    ParamValue {
        value: data.get(0).cloned().unwrap_or(Value::Null),
        timestamp,
        error: None,
    }
}

/// Connection to one upstream node
#[derive(Clone)]
pub struct SecopClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SecopClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecopClient")
            .field("uri", &self.inner.uri)
            .field("online", &self.is_online())
            .finish()
    }
}

impl SecopClient {
    /// Create a client for `host:port`; nothing is connected yet
    pub fn new(uri: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                uri: uri.into(),
                session: Mutex::new(Session::default()),
                cache: RwLock::new(BTreeMap::new()),
                request_locks: Mutex::new(HashMap::new()),
                events,
                disconnected: Notify::new(),
                shutdown: CancellationToken::new(),
                timeout: REQUEST_TIMEOUT,
            }),
        }
    }

    /// Node address
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Whether the connection is up
    pub fn is_online(&self) -> bool {
        self.inner.session.lock().writer.is_some()
    }

    /// Identification string of the node
    pub fn identification(&self) -> Option<String> {
        self.inner.session.lock().identification.clone()
    }

    /// Last descriptive data of the node
    pub fn description(&self) -> Option<Value> {
        self.inner.session.lock().description.clone()
    }

    /// Module names in description order
    pub fn modules(&self) -> Vec<String> {
        self.description()
            .as_ref()
            .and_then(|d| d.get("modules"))
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the cache
    pub fn cached(&self) -> Vec<(String, String, ParamValue)> {
        self.inner
            .cache
            .read()
            .iter()
            .map(|((m, p), r)| (m.clone(), p.clone(), r.clone()))
            .collect()
    }

    /// Cached record of one parameter
    pub fn cached_value(&self, module: &str, param: &str) -> Option<ParamValue> {
        self.inner
            .cache
            .read()
            .get(&(module.to_string(), param.to_string()))
            .cloned()
    }

    /// Receive connection events and updates
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the background task and drop the connection
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        self.drop_session();
    }

    fn emit(&self, event: ClientEvent) {
        // nobody listening is fine
        let _ = self.inner.events.send(event);
    }

    /// Connect once: identify, fetch the description and activate
    ///
    /// Returns when the cache holds the node's baseline.
    pub async fn connect(&self) -> Result<(), SecopError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.inner.uri))
            .await
            .map_err(|_| SecopError::CommunicationFailed(format!("timeout connecting to {}", self.inner.uri)))?
            .map_err(|e| SecopError::CommunicationFailed(format!("{}: {e}", self.inner.uri)))?;
        stream.set_nodelay(true).ok();
        let (mut sink, mut stream) = Framed::new(stream, SecopCodec::new()).split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = {
            let mut session = self.inner.session.lock();
            session.generation += 1;
            session.writer = Some(tx);
            session.generation
        };

        let shutdown = self.inner.shutdown.child_token();
        let session_stop = shutdown.clone();
        let writer_stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(Ok(msg))) => client.dispatch_incoming(msg),
                        Some(Ok(Err(e))) => warn!(node = %client.inner.uri, error = %e, "undecodable line"),
                        Some(Err(_)) | None => break,
                    },
                }
            }
            shutdown.cancel();
            client.connection_lost(generation);
        });

        if let Err(e) = self.handshake().await {
            session_stop.cancel();
            self.drop_session();
            return Err(e);
        }
        info!(node = %self.inner.uri, "connected");
        self.emit(ClientEvent::Connected);
        Ok(())
    }

    async fn handshake(&self) -> Result<(), SecopError> {
        let ident = self.request(Message::new(IDENT_REQUEST, None, None)).await?;
        if !ident.action.starts_with(IDENT_PREFIX) && !ident.action.starts_with(LEGACY_IDENT_PREFIX) {
            return Err(SecopError::CommunicationFailed(format!(
                "{} is not a SEC node: {ident}",
                self.inner.uri
            )));
        }
        let describing = self
            .request(Message::request(Action::Describe, None, None))
            .await?;
        let description = describing.data.unwrap_or(Value::Null);
        let changed = {
            let mut session = self.inner.session.lock();
            session.identification = Some(ident.to_string());
            let changed = session
                .description
                .as_ref()
                .is_some_and(|old| *old != description);
            session.description = Some(description);
            changed
        };
        if changed {
            warn!(node = %self.inner.uri, "descriptive data changed");
            self.emit(ClientEvent::DescriptionChanged);
        }
        self.request(Message::request(Action::Activate, None, None))
            .await?;
        Ok(())
    }

    fn drop_session(&self) {
        let pending = {
            let mut session = self.inner.session.lock();
            session.writer = None;
            std::mem::take(&mut session.pending)
        };
        // dropping the senders fails the waiting requests
        drop(pending);
    }

    fn connection_lost(&self, generation: u64) {
        let pending = {
            let mut session = self.inner.session.lock();
            if session.generation != generation || session.writer.take().is_none() {
                return;
            }
            std::mem::take(&mut session.pending)
        };
        drop(pending);
        warn!(node = %self.inner.uri, "connection lost");
        let failed: Vec<_> = {
            let mut cache = self.inner.cache.write();
            let t = now();
            cache
                .iter_mut()
                .map(|((module, param), record)| {
                    let err = SecopError::CommunicationFailed(format!("connection to {} lost", self.inner.uri));
                    *record = ParamValue::failed(record, err, t);
                    (module.clone(), param.clone(), record.clone())
                })
                .collect()
        };
        for (module, param, record) in failed {
            self.emit(ClientEvent::Update {
                module,
                param,
                record,
            });
        }
        self.emit(ClientEvent::Disconnected);
        self.inner.disconnected.notify_waiters();
    }

    fn dispatch_incoming(&self, msg: Message) {
        trace!(node = %self.inner.uri, msg = %msg, "received");
        let update = msg.action == EVENT_REPLY || msg.action == format!("error_{EVENT_REPLY}");
        if update {
            let (Some(spec), Some(data)) = (msg.specifier.as_deref(), msg.data.as_ref()) else {
                return;
            };
            let Some((module, param)) = spec.split_once(':') else {
                return;
            };
            let record = record_from_report(msg.is_error(), data);
            self.inner
                .cache
                .write()
                .insert((module.to_string(), param.to_string()), record.clone());
            self.emit(ClientEvent::Update {
                module: module.to_string(),
                param: param.to_string(),
                record,
            });
            return;
        }
        let Some(key) = reply_key(&msg) else {
            // help lines and log records are not replies
            trace!(node = %self.inner.uri, action = %msg.action, "ignored");
            return;
        };
        let waiter = self.inner.session.lock().pending.remove(&key);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(msg);
            }
            None => debug!(node = %self.inner.uri, reply = %msg, "unexpected reply"),
        }
    }

    /// Send a request and return the raw reply, error replies included
    pub async fn exchange(&self, msg: Message) -> Result<Message, SecopError> {
        let key = request_key(&msg);
        let lock = self
            .inner
            .request_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone();
        let _serialized = lock.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut session = self.inner.session.lock();
            let writer = session.writer.clone().ok_or_else(|| {
                SecopError::CommunicationFailed(format!("no connection to {}", self.inner.uri))
            })?;
            session.pending.insert(key.clone(), tx);
            if writer.send(msg).is_err() {
                session.pending.remove(&key);
                return Err(SecopError::CommunicationFailed(format!(
                    "connection to {} lost",
                    self.inner.uri
                )));
            }
        }
        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SecopError::CommunicationFailed(format!(
                "connection to {} lost",
                self.inner.uri
            ))),
            Err(_) => {
                self.inner.session.lock().pending.remove(&key);
                Err(SecopError::CommunicationFailed(format!(
                    "no reply from {} within {:?}",
                    self.inner.uri, self.inner.timeout
                )))
            }
        }
    }

    /// Send a request; an error reply becomes `Err`
    pub async fn request(&self, msg: Message) -> Result<Message, SecopError> {
        let reply = self.exchange(msg).await?;
        if reply.is_error() {
            return Err(reply_error(&reply));
        }
        Ok(reply)
    }

    /// Read a parameter
    pub async fn read(&self, module: &str, param: &str) -> Result<ParamValue, SecopError> {
        let spec = format!("{module}:{param}");
        let reply = self
            .request(Message::request(Action::Read, Some(&spec), None))
            .await?;
        Ok(record_from_report(false, reply.data.as_ref().unwrap_or(&Value::Null)))
    }

    /// Change a parameter
    pub async fn change(&self, module: &str, param: &str, value: Value) -> Result<ParamValue, SecopError> {
        let spec = format!("{module}:{param}");
        let reply = self
            .request(Message::request(Action::Change, Some(&spec), Some(value)))
            .await?;
        Ok(record_from_report(false, reply.data.as_ref().unwrap_or(&Value::Null)))
    }

    /// Keep the connection up until [`SecopClient::close`]
    ///
    /// Reconnects with exponential backoff after every loss. Returns the
    /// task handle.
    pub fn spawn(&self, policy: RecoveryPolicy) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                if !client.is_online() {
                    match client.connect().await {
                        Ok(()) => attempt = 0,
                        Err(e) => {
                            let delay = policy.delay_for_attempt(attempt);
                            attempt = attempt.saturating_add(1);
                            if !policy.should_attempt(attempt) {
                                warn!(node = %client.inner.uri, error = %e, "giving up");
                                return;
                            }
                            debug!(node = %client.inner.uri, error = %e, ?delay, "reconnect failed");
                            tokio::select! {
                                _ = client.inner.shutdown.cancelled() => return,
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                    }
                }
                let lost = client.inner.disconnected.notified();
                tokio::pin!(lost);
                lost.as_mut().enable();
                if !client.is_online() {
                    continue;
                }
                tokio::select! {
                    _ = client.inner.shutdown.cancelled() => return,
                    _ = lost => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::datatype::DataType;
    use crate::core::dispatcher::{Dispatcher, NodeInfo};
    use crate::core::module::{Module, Parameter};
    use crate::core::protocol::IDENT_REPLY;
    use crate::core::transport::{bind_listener, serve_tcp, HandlerOptions};
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn node() -> (Arc<Dispatcher>, u16, CancellationToken) {
        node_on(0).await
    }

    async fn node_on(port: u16) -> (Arc<Dispatcher>, u16, CancellationToken) {
        let dispatcher = Dispatcher::new(NodeInfo::new("upstream", "an upstream node"));
        let module = Module::builder("T")
            .parameter(Parameter::new("value", DataType::double(Some("K"))).initial(json!(1.5)))
            .parameter(Parameter::new("target", DataType::double(None)).writable())
            .build()
            .unwrap();
        dispatcher.register_module(Arc::new(module)).unwrap();
        let shutdown = CancellationToken::new();
        let listener = bind_listener(port, false, &shutdown).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve_tcp(
            listener,
            dispatcher.clone(),
            HandlerOptions::default(),
            shutdown.clone(),
        ));
        (dispatcher, port, shutdown)
    }

    #[test]
    fn test_reply_keys_match_requests() {
        let request = Message::request(Action::Read, Some("T:value"), None);
        let reply = Message::reply(Action::Read, Some("T:value"), Some(json!([1, {}])));
        assert_eq!(reply_key(&reply), Some(request_key(&request)));

        let describe = Message::request(Action::Describe, None, None);
        let describing = Message::reply(Action::Describe, Some("."), Some(json!({})));
        assert_eq!(reply_key(&describing), Some(request_key(&describe)));

        let err = Message::new("error_change", Some("T:target".into()), Some(json!(["ReadOnlyError", "no", {}])));
        assert_eq!(reply_key(&err), Some(("change".to_string(), Some("T:target".to_string()))));
        assert!(matches!(reply_error(&err), SecopError::ReadOnly(_)));

        let ident = Message::new("ISSE&SINE2020,SECoP,V2019-08-20,v1.0 RC2", None, None);
        assert_eq!(reply_key(&ident), Some(("*IDN?".to_string(), None)));
        assert_eq!(reply_key(&Message::new("_", Some("0".into()), None)), None);
    }

    #[test]
    fn test_record_from_report() {
        let ok = record_from_report(false, &json!([2.5, {"t": 10.0}]));
        assert_eq!(ok.value, json!(2.5));
        assert_eq!(ok.timestamp, Some(10.0));
        let failed = record_from_report(true, &json!(["HardwareError", "broken", {"t": 11.0}]));
        assert!(matches!(failed.error, Some(SecopError::Hardware(_))));
        assert_eq!(failed.timestamp, Some(11.0));
    }

    #[tokio::test]
    async fn test_connect_fills_cache_and_follows_updates() {
        let (dispatcher, port, shutdown) = node().await;
        let client = SecopClient::new(format!("127.0.0.1:{port}"));
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        assert!(client.is_online());
        assert_eq!(client.modules(), ["T"]);
        assert_eq!(client.cached_value("T", "value").unwrap().value, json!(1.5));
        assert!(client.identification().unwrap().starts_with(IDENT_PREFIX));

        let record = client.change("T", "target", json!(3.0)).await.unwrap();
        assert_eq!(record.value, json!(3.0));
        let err = client.change("T", "value", json!(3.0)).await.unwrap_err();
        assert!(matches!(err, SecopError::ReadOnly(_)));

        dispatcher
            .module("T")
            .unwrap()
            .set_parameter("value", &json!(7.0))
            .unwrap();
        loop {
            if let ClientEvent::Update { param, record, .. } = events.recv().await.unwrap() {
                if param == "value" && record.value == json!(7.0) {
                    break;
                }
            }
        }
        assert_eq!(client.cached_value("T", "value").unwrap().value, json!(7.0));

        client.close();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_marks_cache_failed() {
        let (_dispatcher, port, shutdown) = node().await;
        let client = SecopClient::new(format!("127.0.0.1:{port}"));
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        shutdown.cancel();
        loop {
            if events.recv().await.unwrap() == ClientEvent::Disconnected {
                break;
            }
        }
        assert!(!client.is_online());
        let record = client.cached_value("T", "value").unwrap();
        assert!(matches!(record.error, Some(SecopError::CommunicationFailed(_))));
        let err = client.read("T", "value").await.unwrap_err();
        assert!(matches!(err, SecopError::CommunicationFailed(_)));
    }

    fn fast_retry() -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: 0,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
        }
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

    // Accept one connection and answer the handshake by hand
    async fn answer_handshake(listener: &TcpListener, describe_reply: &str, activate: bool) -> TcpStream {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), IDENT_REQUEST);
        stream.get_mut().write_all(format!("{IDENT_REPLY}\n").as_bytes()).await.unwrap();
        line.clear();
        stream.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "describe");
        stream.get_mut().write_all(format!("{describe_reply}\n").as_bytes()).await.unwrap();
        if activate {
            line.clear();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim(), "activate");
            stream.get_mut().write_all(b"active\n").await.unwrap();
        }
        stream.into_inner()
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_next_session_alone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let first = answer_handshake(&listener, r#"error_describe . ["InternalError","broken",{}]"#, false).await;
            let second = answer_handshake(&listener, r#"describing . {"modules":{}}"#, true).await;
            (first, second)
        });

        let client = SecopClient::new(format!("127.0.0.1:{port}"));
        let mut events = client.subscribe();
        assert!(matches!(client.connect().await, Err(SecopError::Internal(_))));
        assert!(!client.is_online());
        client.connect().await.unwrap();
        assert!(client.is_online());

        let (first, _second) = peer.await.unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(client.is_online());
        while let Ok(event) = events.try_recv() {
            assert_ne!(event, ClientEvent::Disconnected);
        }
        client.close();
    }

    #[tokio::test]
    async fn test_reconnects_and_refills_cache() {
        let (_dispatcher, port, shutdown) = node().await;
        let client = SecopClient::new(format!("127.0.0.1:{port}"));
        let task = client.spawn(fast_retry());
        let baseline = |client: &SecopClient| client.cached_value("T", "value").is_some_and(|r| r.error.is_none());
        until("first connect", || baseline(&client)).await;

        shutdown.cancel();
        until("connection loss", || !client.is_online()).await;
        let record = client.cached_value("T", "value").unwrap();
        assert!(matches!(record.error, Some(SecopError::CommunicationFailed(_))));

        // the loop keeps retrying while the node is gone
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        let (dispatcher, _, shutdown) = node_on(port).await;
        until("reconnect", || baseline(&client)).await;
        assert!(client.is_online());
        let record = client.cached_value("T", "value").unwrap();
        assert!(record.error.is_none());
        assert_eq!(record.value, json!(1.5));

        dispatcher
            .module("T")
            .unwrap()
            .set_parameter("value", &json!(4.0))
            .unwrap();
        until("update after reconnect", || {
            client.cached_value("T", "value").is_some_and(|r| r.value == json!(4.0))
        })
        .await;

        client.close();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let client = SecopClient::new("127.0.0.1:1");
        assert!(matches!(
            client.connect().await,
            Err(SecopError::CommunicationFailed(_))
        ));
        assert!(!client.is_online());
    }
}
