//! Request dispatcher
//!
//! The dispatcher owns the module registry view, the connection table and
//! the subscription table. All requests and all parameter updates pass one
//! reentrant lock, so a reader never sees a half updated module and events
//! reach each connection in the order they were announced.

use crate::core::codec::{split_specifier, Message};
use crate::core::errors::SecopError;
use crate::core::logger::{log_event, LogLevel, LogLevels};
use crate::core::module::{Module, ParamValue, RegistryError, UpdateSink};
use crate::core::protocol::Action;
use crate::core::transport::{Connection, ConnectionId};
use crate::utils::now;
use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Firmware string sent in the node description
pub const FIRMWARE: &str = "secnode - SECoP node in Rust";

/// Entry point used by connection handlers; implemented by the plain
/// dispatcher and by the router
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Register a new connection
    fn add_connection(&self, conn: Connection);

    /// Forget a connection together with its subscriptions
    fn remove_connection(&self, id: ConnectionId);

    /// Handle one request and return its reply
    async fn handle_request(&self, conn: ConnectionId, msg: Message) -> Result<Message, SecopError>;
}

/// Node level description
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Equipment id
    pub equipment_id: String,
    /// Node description
    pub description: String,
    /// Extra node properties
    pub properties: Map<String, Value>,
}

impl NodeInfo {
    /// Create a node description
    pub fn new(equipment_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            description: description.into(),
            properties: Map::new(),
        }
    }
}

/// A request decoded from a message
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    /// `*IDN?`
    Identify,
    /// `help` or an empty line
    Help,
    /// `describe [module[:accessible]]`
    Describe(Option<&'a str>),
    /// `read module[:param]`
    Read {
        /// Module name
        module: &'a str,
        /// Parameter name, `value` when omitted
        param: &'a str,
    },
    /// `change module[:param] value`
    Change {
        /// Module name
        module: &'a str,
        /// Parameter name, `target` when omitted
        param: &'a str,
        /// New value
        value: Value,
    },
    /// `do module:command [argument]`
    Do {
        /// Module name
        module: &'a str,
        /// Command name
        command: &'a str,
        /// Argument
        argument: Option<&'a Value>,
    },
    /// `ping [nonce]`
    Ping(Option<&'a str>),
    /// `activate [module[:param]]`
    Activate(Option<&'a str>),
    /// `deactivate [module[:param]]`
    Deactivate(Option<&'a str>),
    /// `logging [module] level`
    Logging {
        /// Module, all modules when `None`
        module: Option<&'a str>,
        /// Requested level
        level: LogLevel,
    },
}

fn no_data(msg: &Message) -> Result<(), SecopError> {
    match &msg.data {
        Some(_) => Err(SecopError::Protocol(format!(
            "{} requests don't take data!",
            msg.action
        ))),
        None => Ok(()),
    }
}

fn need_specifier(msg: &Message) -> Result<&str, SecopError> {
    msg.specifier.as_deref().ok_or_else(|| {
        SecopError::Protocol(format!("{} requests need a specifier!", msg.action))
    })
}

impl<'a> Request<'a> {
    /// Decode a request message
    pub fn parse(msg: &'a Message) -> Result<Self, SecopError> {
        if msg.is_help() {
            return Ok(Request::Help);
        }
        let action = Action::from_request(&msg.action)
            .ok_or_else(|| SecopError::Protocol(format!("unhandled message: {msg}")))?;
        let specifier = msg.specifier.as_deref();
        Ok(match action {
            Action::Identify => Request::Identify,
            Action::Help => Request::Help,
            Action::Describe => Request::Describe(specifier),
            Action::Read => {
                no_data(msg)?;
                let (module, param) = split_specifier(need_specifier(msg)?);
                Request::Read {
                    module,
                    param: param.unwrap_or("value"),
                }
            }
            Action::Change => {
                let (module, param) = split_specifier(need_specifier(msg)?);
                Request::Change {
                    module,
                    param: param.unwrap_or("target"),
                    value: msg.data.clone().unwrap_or(Value::Null),
                }
            }
            Action::Do => {
                let (module, command) = split_specifier(need_specifier(msg)?);
                let command = command.ok_or_else(|| {
                    SecopError::Protocol("do requests need a module:command specifier!".into())
                })?;
                Request::Do {
                    module,
                    command,
                    argument: msg.data.as_ref(),
                }
            }
            Action::Ping => {
                no_data(msg)?;
                Request::Ping(specifier)
            }
            Action::Activate => {
                no_data(msg)?;
                Request::Activate(specifier)
            }
            Action::Deactivate => {
                no_data(msg)?;
                Request::Deactivate(specifier)
            }
            Action::Logging => Request::Logging {
                module: specifier.filter(|s| *s != "."),
                level: LogLevel::from_request(msg.data.as_ref())?,
            },
        })
    }
}

/// Event message for a cached value
pub fn make_update(module: &str, param: &str, record: &ParamValue) -> Message {
    Message::event(format!("{module}:{param}"), record.report(), record.error.is_some())
}

#[derive(Default)]
struct State {
    connections: HashMap<ConnectionId, Connection>,
    active: HashSet<ConnectionId>,
    subscriptions: HashMap<String, HashSet<ConnectionId>>,
    log_levels: HashMap<ConnectionId, LogLevels>,
}

impl State {
    fn send(&self, conn: ConnectionId, msg: Message) {
        if let Some(connection) = self.connections.get(&conn) {
            connection.send(msg);
        }
    }

    fn reset(&mut self, conn: ConnectionId) {
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(&conn);
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        self.active.remove(&conn);
        self.log_levels.remove(&conn);
    }
}

/// The request dispatcher of a node
pub struct Dispatcher {
    node: NodeInfo,
    request_lock: ReentrantMutex<()>,
    modules: RwLock<Vec<Arc<Module>>>,
    state: Mutex<State>,
    this: Weak<Dispatcher>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("equipment_id", &self.node.equipment_id)
            .field("modules", &self.module_names())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher without modules
    pub fn new(node: NodeInfo) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            node,
            request_lock: ReentrantMutex::new(()),
            modules: RwLock::new(Vec::new()),
            state: Mutex::new(State::default()),
            this: this.clone(),
        })
    }

    /// Node description
    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    /// Add a module and attach it as update receiver
    pub fn register_module(&self, module: Arc<Module>) -> Result<(), RegistryError> {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return Err(RegistryError::DuplicateModule(module.name().to_string()));
        }
        debug!(module = module.name(), "registering module");
        let sink: Weak<dyn UpdateSink> = self.this.clone();
        module.attach(sink);
        modules.push(module);
        Ok(())
    }

    /// Remove a module and every subscription to it
    pub fn remove_module(&self, name: &str) -> Result<Arc<Module>, SecopError> {
        let _guard = self.request_lock.lock();
        let module = {
            let mut modules = self.modules.write();
            let idx = modules
                .iter()
                .position(|m| m.name() == name)
                .ok_or_else(|| SecopError::no_such_module(name))?;
            modules.remove(idx)
        };
        module.detach();
        let prefix = format!("{name}:");
        self.state
            .lock()
            .subscriptions
            .retain(|key, _| key != name && !key.starts_with(&prefix));
        Ok(module)
    }

    /// Look up a module
    pub fn module(&self, name: &str) -> Result<Arc<Module>, SecopError> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| SecopError::no_such_module(name))
    }

    /// Whether a module is registered
    pub fn has_module(&self, name: &str) -> bool {
        self.modules.read().iter().any(|m| m.name() == name)
    }

    /// All modules in registration order
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.modules.read().clone()
    }

    /// Names of all modules in registration order
    pub fn module_names(&self) -> Vec<String> {
        self.modules.read().iter().map(|m| m.name().to_string()).collect()
    }

    /// Register a connection
    pub fn add_connection(&self, conn: Connection) {
        debug!(conn = %conn.id(), peer = conn.peer(), "new connection");
        self.state.lock().connections.insert(conn.id(), conn);
    }

    /// Remove a connection and all its subscriptions
    pub fn remove_connection(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        state.connections.remove(&id);
        state.reset(id);
        debug!(conn = %id, "connection removed");
    }

    /// Clear subscriptions, active flag and log levels of a connection
    pub fn reset_connection(&self, id: ConnectionId) {
        self.state.lock().reset(id);
    }

    /// Number of registered connections
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Subscribe a connection to `module` or `module:param`
    pub fn subscribe(&self, id: ConnectionId, key: &str) {
        self.state
            .lock()
            .subscriptions
            .entry(key.to_string())
            .or_default()
            .insert(id);
    }

    /// Unsubscribe; a bare module also drops all `module:*` subscriptions
    pub fn unsubscribe(&self, id: ConnectionId, key: &str) {
        let mut state = self.state.lock();
        if !key.contains(':') {
            let prefix = format!("{key}:");
            for (k, subscribers) in &mut state.subscriptions {
                if k.starts_with(&prefix) {
                    subscribers.remove(&id);
                }
            }
        }
        if let Some(subscribers) = state.subscriptions.get_mut(key) {
            subscribers.remove(&id);
        }
        state.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
    }

    /// Connections subscribed to exactly `key`
    pub fn subscribers(&self, key: &str) -> HashSet<ConnectionId> {
        self.state
            .lock()
            .subscriptions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a connection receives all events
    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.state.lock().active.contains(&id)
    }

    /// Queue a message for one connection
    pub fn send_to(&self, id: ConnectionId, msg: Message) {
        self.state.lock().send(id, msg);
    }

    /// Send an event to subscribers of its specifier, subscribers of the
    /// bare module and all active connections
    pub fn broadcast_event(&self, msg: Message) {
        let _guard = self.request_lock.lock();
        let state = self.state.lock();
        let key = msg.specifier.as_deref().unwrap_or_default();
        let (module, _) = split_specifier(key);
        let mut listeners: HashSet<ConnectionId> = state.active.clone();
        for k in [key, module] {
            if let Some(subscribers) = state.subscriptions.get(k) {
                listeners.extend(subscribers);
            }
        }
        trace!(event = %msg, listeners = listeners.len(), "broadcast");
        for id in listeners {
            state.send(id, msg.clone());
        }
    }

    /// Broadcast a parameter update
    pub fn announce_update(&self, module: &str, param: &str, record: &ParamValue) {
        self.broadcast_event(make_update(module, param, record));
    }

    /// Send a module log record to connections that asked for it
    pub fn send_log(&self, module: &str, level: LogLevel, text: &str) {
        let state = self.state.lock();
        for (id, levels) in &state.log_levels {
            if levels.wants(module, level) {
                state.send(*id, log_event(module, level, text));
            }
        }
    }

    /// Set the remote log level of a connection for one or all modules
    pub fn set_log_level(&self, id: ConnectionId, module: Option<&str>, level: LogLevel) {
        let names = match module {
            Some(name) => vec![name.to_string()],
            None => self.module_names(),
        };
        let mut state = self.state.lock();
        let levels = state.log_levels.entry(id).or_default();
        for name in &names {
            levels.set(name, level);
        }
        if levels.is_empty() {
            state.log_levels.remove(&id);
        }
    }

    /// Descriptions of all modules
    pub fn describe_modules(&self) -> Map<String, Value> {
        self.modules
            .read()
            .iter()
            .map(|m| (m.name().to_string(), m.describe()))
            .collect()
    }

    /// Node level description around a module map
    pub fn node_description(&self, modules: Map<String, Value>, description: &str) -> Value {
        let mut result = Map::new();
        result.insert("modules".into(), Value::Object(modules));
        result.insert("equipment_id".into(), json!(self.node.equipment_id));
        result.insert("firmware".into(), json!(FIRMWARE));
        result.insert("version".into(), json!(crate::VERSION));
        result.insert("description".into(), json!(description));
        for (key, value) in &self.node.properties {
            result.insert(key.clone(), value.clone());
        }
        Value::Object(result)
    }

    /// Descriptive data for the node, one module or one accessible
    pub fn descriptive_data(&self, specifier: Option<&str>) -> Result<Value, SecopError> {
        let spec = specifier.unwrap_or_default();
        let (module, accessible) = split_specifier(spec);
        if module.is_empty() || module == "." {
            return Ok(self.node_description(self.describe_modules(), &self.node.description));
        }
        let module = self.module(module)?;
        match accessible {
            None | Some("") => Ok(module.describe()),
            Some(name) => module
                .describe_accessible(name)
                .ok_or_else(|| SecopError::no_such_parameter(module.name(), name)),
        }
    }

    fn activate(&self, conn: ConnectionId, specifier: Option<&str>) -> Result<Message, SecopError> {
        let mut updates = Vec::new();
        match specifier {
            Some(spec) => {
                let (name, param) = split_specifier(spec);
                let module = self.module(name)?;
                match param {
                    Some(param) => {
                        module.parameter(param)?;
                        if let Some(record) = module.record(param) {
                            updates.push(make_update(name, param, &record));
                        }
                    }
                    None => updates.extend(
                        module
                            .exported_records()
                            .iter()
                            .map(|(p, r)| make_update(name, p, r)),
                    ),
                }
                self.subscribe(conn, spec);
            }
            None => {
                self.state.lock().active.insert(conn);
                for module in self.modules() {
                    updates.extend(
                        module
                            .exported_records()
                            .iter()
                            .map(|(p, r)| make_update(module.name(), p, r)),
                    );
                }
            }
        }
        let state = self.state.lock();
        for update in updates {
            state.send(conn, update);
        }
        Ok(Message::reply(Action::Activate, specifier, None))
    }

    fn deactivate(&self, conn: ConnectionId, specifier: Option<&str>) -> Message {
        match specifier {
            Some(spec) => self.unsubscribe(conn, spec),
            None => {
                self.state.lock().active.remove(&conn);
            }
        }
        Message::reply(Action::Deactivate, None, None)
    }

    /// Handle one request; the router reuses this for local modules
    pub fn handle(&self, conn: ConnectionId, msg: &Message) -> Result<Message, SecopError> {
        let _guard = self.request_lock.lock();
        trace!(conn = %conn, request = %msg, "handling");
        let spec = msg.specifier.as_deref();
        match Request::parse(msg)? {
            Request::Identify => {
                self.reset_connection(conn);
                Ok(Message::new(Action::Identify.reply(), None, None))
            }
            Request::Help => Ok(Message::reply(Action::Help, None, None)),
            Request::Describe(specifier) => Ok(Message::reply(
                Action::Describe,
                Some(specifier.unwrap_or(".")),
                Some(self.descriptive_data(specifier)?),
            )),
            Request::Read { module, param } => {
                let record = self.module(module)?.read_param(param)?;
                Ok(Message::reply(Action::Read, spec, Some(record.report())))
            }
            Request::Change {
                module,
                param,
                value,
            } => {
                let record = self.module(module)?.write_param(param, &value)?;
                Ok(Message::reply(Action::Change, spec, Some(record.report())))
            }
            Request::Do {
                module,
                command,
                argument,
            } => {
                let result = self.module(module)?.call(command, argument)?;
                Ok(Message::reply(
                    Action::Do,
                    spec,
                    Some(json!([result, { "t": now() }])),
                ))
            }
            Request::Ping(nonce) => Ok(Message::reply(
                Action::Ping,
                nonce,
                Some(json!([null, { "t": now() }])),
            )),
            Request::Activate(specifier) => self.activate(conn, specifier),
            Request::Deactivate(specifier) => Ok(self.deactivate(conn, specifier)),
            Request::Logging { module, level } => {
                if let Some(name) = module {
                    self.module(name)?;
                }
                self.set_log_level(conn, module, level);
                Ok(Message::reply(Action::Logging, spec, msg.data.clone()))
            }
        }
    }
}

impl UpdateSink for Dispatcher {
    fn commit_update(&self, module: &str, param: &str, commit: &mut dyn FnMut() -> ParamValue) {
        let _guard = self.request_lock.lock();
        let record = commit();
        self.announce_update(module, param, &record);
    }

    fn log_record(&self, module: &str, level: LogLevel, text: &str) {
        self.send_log(module, level, text);
    }
}

#[async_trait]
impl Dispatch for Dispatcher {
    fn add_connection(&self, conn: Connection) {
        Dispatcher::add_connection(self, conn);
    }

    fn remove_connection(&self, id: ConnectionId) {
        Dispatcher::remove_connection(self, id);
    }

    async fn handle_request(&self, conn: ConnectionId, msg: Message) -> Result<Message, SecopError> {
        self.handle(conn, &msg)
    }
}
