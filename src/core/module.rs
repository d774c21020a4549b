//! Module registry entries
//!
//! A [`Module`] owns the static description of its parameters and commands,
//! the cached value record of every parameter and a [`Driver`] that talks
//! to the hardware. Every stored record is handed to the attached
//! [`UpdateSink`] so subscribers see each change.

use crate::core::datatype::DataType;
use crate::core::errors::SecopError;
use crate::core::logger::LogLevel;
use crate::core::poller::PollType;
use crate::utils::now;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Default base poll interval in seconds
pub const DEFAULT_POLLINTERVAL: f64 = 5.0;

/// Errors building or registering modules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Name does not match `[A-Za-z][A-Za-z0-9_]*`
    #[error("invalid name '{0}': must start with a letter and contain only letters, digits and '_'")]
    InvalidName(String),

    /// Two accessibles of one module share a name
    #[error("module '{module}' defines '{name}' twice")]
    DuplicateAccessible {
        /// Module name
        module: String,
        /// Accessible name
        name: String,
    },

    /// Module name already registered
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),
}

/// Check a module name
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Check an accessible name; custom accessibles may start with `_`
pub fn validate_accessible_name(name: &str) -> Result<(), RegistryError> {
    validate_name(name.strip_prefix('_').unwrap_or(name))
        .map_err(|_| RegistryError::InvalidName(name.to_string()))
}

/// Cached value of a parameter
///
/// When `error` is set the value is not authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamValue {
    /// Last value
    pub value: Value,
    /// Time of the last read or write
    pub timestamp: Option<f64>,
    /// Read error replacing the value
    pub error: Option<SecopError>,
}

impl ParamValue {
    /// A successful read or write
    pub fn new(value: Value, timestamp: f64) -> Self {
        Self {
            value,
            timestamp: Some(timestamp),
            error: None,
        }
    }

    /// A record with no timestamp yet
    pub fn initial(value: Value) -> Self {
        Self {
            value,
            timestamp: None,
            error: None,
        }
    }

    /// A failed read; the last value is kept but no longer authoritative
    pub fn failed(previous: &ParamValue, error: SecopError, timestamp: f64) -> Self {
        Self {
            value: previous.value.clone(),
            timestamp: Some(timestamp),
            error: Some(error),
        }
    }

    /// `{"t": ts}` or `{}`
    pub fn qualifiers(&self) -> Value {
        match self.timestamp {
            Some(t) => json!({ "t": t }),
            None => json!({}),
        }
    }

    /// Data field of a reply or event: `[value, {t}]` or an error report
    pub fn report(&self) -> Value {
        match &self.error {
            Some(err) => err.report(self.qualifiers()),
            None => json!([self.value, self.qualifiers()]),
        }
    }
}

/// Poll setting of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Poll {
    /// Never polled
    None,
    /// Derived from the parameter name and flags
    #[default]
    Auto,
    /// Polled every interval
    Regular,
    /// Polled every fourth interval
    Slow,
    /// Polled faster while the module is busy
    Dynamic,
}

/// Static description of a parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Name, unique within the module
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Datatype
    pub datatype: DataType,
    /// Whether clients may change it
    pub readonly: bool,
    /// Whether clients can see it at all
    pub export: bool,
    /// Fixed value, never read from hardware
    pub constant: Option<Value>,
    /// Poll setting
    pub poll: Poll,
    /// Value before the first read
    pub initial: Option<Value>,
    /// Optional grouping shown in `describe`
    pub group: Option<String>,
}

impl Parameter {
    /// Readonly, exported parameter
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            datatype,
            readonly: true,
            export: true,
            constant: None,
            poll: Poll::Auto,
            initial: None,
            group: None,
        }
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Allow `change`
    #[must_use]
    pub fn writable(mut self) -> Self {
        self.readonly = false;
        self
    }

    /// Hide from clients
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.export = false;
        self
    }

    /// Make a constant
    #[must_use]
    pub fn constant(mut self, value: Value) -> Self {
        self.constant = Some(value);
        self.readonly = true;
        self
    }

    /// Set the poll setting
    #[must_use]
    pub fn poll(mut self, poll: Poll) -> Self {
        self.poll = poll;
        self
    }

    /// Set the value before the first read
    #[must_use]
    pub fn initial(mut self, value: Value) -> Self {
        self.initial = Some(value);
        self
    }

    /// Poll class this parameter is scheduled in, if any
    ///
    /// `auto` means DYNAMIC for `value` and `status`, REGULAR for other
    /// readonly parameters and SLOW otherwise. Constants are never polled.
    pub fn poll_type(&self) -> Option<PollType> {
        if self.constant.is_some() {
            return None;
        }
        match self.poll {
            Poll::None => None,
            Poll::Regular => Some(PollType::Regular),
            Poll::Slow => Some(PollType::Slow),
            Poll::Dynamic => Some(PollType::Dynamic),
            Poll::Auto if self.name == "value" || self.name == "status" => Some(PollType::Dynamic),
            Poll::Auto if self.readonly => Some(PollType::Regular),
            Poll::Auto => Some(PollType::Slow),
        }
    }

    fn describe(&self) -> Value {
        let mut desc = Map::new();
        desc.insert("description".into(), json!(self.description));
        desc.insert("datainfo".into(), self.datatype.export());
        desc.insert("readonly".into(), json!(self.readonly));
        if let Some(constant) = &self.constant {
            desc.insert("constant".into(), constant.clone());
        }
        if let Some(group) = &self.group {
            desc.insert("group".into(), json!(group));
        }
        Value::Object(desc)
    }
}

/// Static description of a command
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Name, unique within the module
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Argument type, `None` for commands without argument
    pub argument: Option<DataType>,
    /// Result type, `None` for commands without result
    pub result: Option<DataType>,
}

impl Command {
    /// Command without argument or result
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            argument: None,
            result: None,
        }
    }

    fn describe(&self) -> Value {
        let mut datainfo = Map::new();
        datainfo.insert("type".into(), json!("command"));
        if let Some(argument) = &self.argument {
            datainfo.insert("argument".into(), argument.export());
        }
        if let Some(result) = &self.result {
            datainfo.insert("result".into(), result.export());
        }
        json!({ "description": self.description, "datainfo": datainfo })
    }
}

/// Receiver of parameter updates and module log records (the dispatcher)
pub trait UpdateSink: Send + Sync {
    /// Run `commit` and announce the record it returns, atomically with
    /// respect to other updates and requests
    fn commit_update(&self, module: &str, param: &str, commit: &mut dyn FnMut() -> ParamValue);

    /// Forward a module log record to interested connections
    fn log_record(&self, module: &str, level: LogLevel, text: &str);
}

/// Hardware access of a module
#[cfg_attr(test, mockall::automock)]
pub trait Driver: Send + Sync {
    /// Read a parameter from hardware
    fn read(&self, param: &str, cached: &ParamValue) -> Result<Value, SecopError>;

    /// Write a parameter, returning the value actually set
    fn write(&self, param: &str, value: Value) -> Result<Value, SecopError>;

    /// Execute a command
    fn call(&self, command: &str, argument: Option<Value>) -> Result<Value, SecopError>;
}

/// Driver without hardware: reads return the cached value, writes are stored
#[derive(Debug, Default, Clone, Copy)]
pub struct StoredDriver;

impl Driver for StoredDriver {
    fn read(&self, _param: &str, cached: &ParamValue) -> Result<Value, SecopError> {
        Ok(cached.value.clone())
    }

    fn write(&self, _param: &str, value: Value) -> Result<Value, SecopError> {
        Ok(value)
    }

    fn call(&self, _command: &str, _argument: Option<Value>) -> Result<Value, SecopError> {
        Ok(Value::Null)
    }
}

/// One module of the node
pub struct Module {
    name: String,
    description: String,
    interface_classes: Vec<String>,
    properties: Map<String, Value>,
    pollinterval: f64,
    group: Option<String>,
    parameters: Vec<Parameter>,
    commands: Vec<Command>,
    records: Mutex<HashMap<String, ParamValue>>,
    driver: Box<dyn Driver>,
    sink: RwLock<Option<Weak<dyn UpdateSink>>>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("parameters", &self.parameters.len())
            .field("commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Module`]
pub struct ModuleBuilder {
    name: String,
    description: String,
    interface_classes: Vec<String>,
    properties: Map<String, Value>,
    pollinterval: f64,
    group: Option<String>,
    parameters: Vec<Parameter>,
    commands: Vec<Command>,
    driver: Box<dyn Driver>,
}

impl ModuleBuilder {
    /// Set the description
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add an interface class (`Readable`, `Drivable`, ...)
    #[must_use]
    pub fn interface_class(mut self, class: impl Into<String>) -> Self {
        self.interface_classes.push(class.into());
        self
    }

    /// Add a custom module property
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Set the base poll interval in seconds
    #[must_use]
    pub fn pollinterval(mut self, seconds: f64) -> Self {
        self.pollinterval = seconds;
        self
    }

    /// Poll together with other modules of the same group
    #[must_use]
    pub fn poll_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add a parameter
    #[must_use]
    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Set the hardware driver
    #[must_use]
    pub fn driver(mut self, driver: Box<dyn Driver>) -> Self {
        self.driver = driver;
        self
    }

    /// Validate names and build the module
    pub fn build(self) -> Result<Module, RegistryError> {
        validate_name(&self.name)?;
        let mut seen = HashSet::new();
        let names = self
            .parameters
            .iter()
            .map(|p| &p.name)
            .chain(self.commands.iter().map(|c| &c.name));
        for name in names {
            validate_accessible_name(name)?;
            if !seen.insert(name.as_str()) {
                return Err(RegistryError::DuplicateAccessible {
                    module: self.name.clone(),
                    name: name.clone(),
                });
            }
        }

        let records = self
            .parameters
            .iter()
            .map(|p| {
                let value = p
                    .constant
                    .clone()
                    .or_else(|| p.initial.clone())
                    .unwrap_or_else(|| p.datatype.default_value());
                (p.name.clone(), ParamValue::initial(value))
            })
            .collect();

        Ok(Module {
            name: self.name,
            description: self.description,
            interface_classes: self.interface_classes,
            properties: self.properties,
            pollinterval: self.pollinterval,
            group: self.group,
            parameters: self.parameters,
            commands: self.commands,
            records: Mutex::new(records),
            driver: self.driver,
            sink: RwLock::new(None),
        })
    }
}

impl Module {
    /// Start building a module
    pub fn builder(name: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            name: name.into(),
            description: String::new(),
            interface_classes: Vec::new(),
            properties: Map::new(),
            pollinterval: DEFAULT_POLLINTERVAL,
            group: None,
            parameters: Vec::new(),
            commands: Vec::new(),
            driver: Box::new(StoredDriver),
        }
    }

    /// Module name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base poll interval in seconds
    pub fn pollinterval(&self) -> f64 {
        self.pollinterval
    }

    /// Poll group, defaults to the module name
    pub fn poll_group(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    /// All parameters in definition order
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    /// All commands in definition order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Look up an exported parameter
    pub fn parameter(&self, name: &str) -> Result<&Parameter, SecopError> {
        self.parameters
            .iter()
            .find(|p| p.name == name && p.export)
            .ok_or_else(|| SecopError::no_such_parameter(&self.name, name))
    }

    /// Look up a command
    pub fn command(&self, name: &str) -> Result<&Command, SecopError> {
        self.commands
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| SecopError::no_such_command(&self.name, name))
    }

    /// Attach the receiver of updates
    pub fn attach(&self, sink: Weak<dyn UpdateSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Detach from the update receiver
    pub fn detach(&self) {
        *self.sink.write() = None;
    }

    fn sink(&self) -> Option<Arc<dyn UpdateSink>> {
        self.sink.read().as_ref().and_then(Weak::upgrade)
    }

    /// Cached record of a parameter (exported or not)
    pub fn record(&self, name: &str) -> Option<ParamValue> {
        self.records.lock().get(name).cloned()
    }

    /// Records of all exported parameters in definition order
    pub fn exported_records(&self) -> Vec<(String, ParamValue)> {
        let records = self.records.lock();
        self.parameters
            .iter()
            .filter(|p| p.export)
            .filter_map(|p| records.get(&p.name).map(|r| (p.name.clone(), r.clone())))
            .collect()
    }

    // Store a record and announce it if the parameter is exported
    fn store(&self, name: &str, record: ParamValue) -> ParamValue {
        let exported = self.parameters.iter().any(|p| p.name == name && p.export);
        let mut commit = || {
            self.records.lock().insert(name.to_string(), record.clone());
            record.clone()
        };
        match self.sink() {
            Some(sink) if exported => sink.commit_update(&self.name, name, &mut commit),
            _ => {
                commit();
            }
        }
        record
    }

    /// Validate and store a new value, announcing it to subscribers
    pub fn set_parameter(&self, name: &str, value: &Value) -> Result<ParamValue, SecopError> {
        let param = self
            .parameters
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SecopError::no_such_parameter(&self.name, name))?;
        let value = param.datatype.validate(value)?;
        Ok(self.store(name, ParamValue::new(value, now())))
    }

    /// Store a read error, announcing it to subscribers
    pub fn set_read_error(&self, name: &str, error: SecopError) -> ParamValue {
        let previous = self
            .record(name)
            .unwrap_or_else(|| ParamValue::initial(Value::Null));
        self.store(name, ParamValue::failed(&previous, error, now()))
    }

    /// Read a parameter through the driver
    ///
    /// Constants are returned without touching the driver. A failed read
    /// is cached and announced before the error is returned.
    pub fn read_param(&self, name: &str) -> Result<ParamValue, SecopError> {
        let param = self.parameter(name)?;
        if let Some(constant) = &param.constant {
            return Ok(ParamValue::initial(constant.clone()));
        }
        self.read_internal(param)
    }

    fn read_internal(&self, param: &Parameter) -> Result<ParamValue, SecopError> {
        let cached = self
            .record(&param.name)
            .unwrap_or_else(|| ParamValue::initial(Value::Null));
        let result = self
            .driver
            .read(&param.name, &cached)
            .and_then(|v| param.datatype.validate(&v));
        match result {
            Ok(value) => Ok(self.store(&param.name, ParamValue::new(value, now()))),
            Err(err) => {
                self.set_read_error(&param.name, err.clone());
                Err(err)
            }
        }
    }

    /// Poll one parameter (exported or not)
    pub fn poll_param(&self, name: &str) -> Result<(), SecopError> {
        let param = self
            .parameters
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| SecopError::no_such_parameter(&self.name, name))?;
        self.read_internal(param).map(|_| ())
    }

    /// Change a parameter through the driver
    pub fn write_param(&self, name: &str, value: &Value) -> Result<ParamValue, SecopError> {
        let param = self.parameter(name)?;
        if param.readonly || param.constant.is_some() {
            return Err(SecopError::ReadOnly(format!(
                "Parameter {}:{name} is not changeable",
                self.name
            )));
        }
        let value = param.datatype.validate(value)?;
        let written = self.driver.write(name, value)?;
        let written = param.datatype.validate(&written)?;
        Ok(self.store(name, ParamValue::new(written, now())))
    }

    /// Execute a command, returning its checked result
    pub fn call(&self, name: &str, argument: Option<&Value>) -> Result<Value, SecopError> {
        let command = self.command(name)?;
        let argument = match (&command.argument, argument) {
            (Some(datatype), Some(value)) => Some(datatype.validate(value)?),
            (Some(_), None) => {
                return Err(SecopError::BadValue(format!(
                    "Command {}:{name} needs an argument",
                    self.name
                )))
            }
            (None, Some(value)) if !value.is_null() => {
                return Err(SecopError::BadValue(format!(
                    "Command {}:{name} takes no argument",
                    self.name
                )))
            }
            (None, _) => None,
        };
        let result = self.driver.call(name, argument)?;
        match &command.result {
            Some(datatype) => datatype.validate(&result),
            None => Ok(Value::Null),
        }
    }

    /// Whether the `status` code is in the BUSY range
    pub fn is_busy(&self) -> bool {
        self.records
            .lock()
            .get("status")
            .and_then(|r| r.value.get(0))
            .and_then(Value::as_i64)
            .is_some_and(|code| (300..400).contains(&code))
    }

    /// Emit a module log record
    pub fn log(&self, level: LogLevel, text: &str) {
        level.trace(&self.name, text);
        if let Some(sink) = self.sink() {
            sink.log_record(&self.name, level, text);
        }
    }

    /// Description of one exported accessible
    pub fn describe_accessible(&self, name: &str) -> Option<Value> {
        if let Ok(param) = self.parameter(name) {
            return Some(param.describe());
        }
        self.command(name).ok().map(Command::describe)
    }

    /// Module description as sent in `describe`
    pub fn describe(&self) -> Value {
        let mut accessibles = Map::new();
        for param in self.parameters.iter().filter(|p| p.export) {
            accessibles.insert(param.name.clone(), param.describe());
        }
        for command in &self.commands {
            accessibles.insert(command.name.clone(), command.describe());
        }
        let mut desc = Map::new();
        desc.insert("accessibles".into(), Value::Object(accessibles));
        desc.insert("description".into(), json!(self.description));
        desc.insert("interface_classes".into(), json!(self.interface_classes));
        for (key, value) in &self.properties {
            desc.insert(key.clone(), value.clone());
        }
        Value::Object(desc)
    }
}
