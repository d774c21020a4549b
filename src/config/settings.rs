//! Node configuration file

use crate::core::datatype::DataType;
use crate::core::dispatcher::NodeInfo;
use crate::core::module::{Command, Module, Parameter, Poll, RegistryError};
use crate::core::transport::{HandlerOptions, Interface};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Can not read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or schema error
    #[error("Invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Bad module or parameter name, duplicates
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Both `node` and `nodes` given for the router
    #[error("Can not specify router node and nodes")]
    NodeAndNodes,

    /// Router section without any node
    #[error("Router needs node or nodes")]
    NoRouterNodes,

    /// No configuration file given and no default location
    #[error("No configuration file found")]
    NotFound,
}

fn default_interfaces() -> Vec<Interface> {
    vec![Interface::tcp(10767)]
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout() -> f64 {
    30.0
}

/// The `[node]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    /// Equipment id
    pub equipment_id: String,
    /// Node description
    #[serde(default)]
    pub description: String,
    /// Listening interfaces
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<Interface>,
    /// Send exception details with error replies
    #[serde(default = "default_true")]
    pub detailed_errors: bool,
    /// Listen on IPv6 (dual stack)
    #[serde(default)]
    pub ipv6: bool,
    /// Answer UDP discovery
    #[serde(default)]
    pub discovery: bool,
    /// Seconds to wait for the first poll sweep of every poller
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: f64,
    /// Extra node properties sent in `describe`
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// The `[router]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSection {
    /// Single upstream node, `host:port`
    #[serde(default)]
    pub node: Option<String>,
    /// Several upstream nodes
    #[serde(default)]
    pub nodes: Vec<String>,
}

impl RouterSection {
    /// Upstream addresses
    pub fn uris(&self) -> Result<Vec<String>, ConfigError> {
        match (&self.node, self.nodes.is_empty()) {
            (Some(_), false) => Err(ConfigError::NodeAndNodes),
            (Some(node), true) => Ok(vec![node.clone()]),
            (None, false) => Ok(self.nodes.clone()),
            (None, true) => Err(ConfigError::NoRouterNodes),
        }
    }
}

/// A `[[modules.parameters]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterConfig {
    /// Name
    pub name: String,
    /// Datatype in datainfo form
    pub datainfo: DataType,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Readonly flag
    #[serde(default = "default_true")]
    pub readonly: bool,
    /// Export flag
    #[serde(default = "default_true")]
    pub export: bool,
    /// Fixed value
    #[serde(default)]
    pub constant: Option<Value>,
    /// Poll setting
    #[serde(default)]
    pub poll: Poll,
    /// Value before the first read
    #[serde(default)]
    pub initial: Option<Value>,
    /// Group shown in `describe`
    #[serde(default)]
    pub group: Option<String>,
}

impl ParameterConfig {
    fn build(&self) -> Parameter {
        let mut param = Parameter::new(&self.name, self.datainfo.clone())
            .with_description(&self.description)
            .poll(self.poll);
        param.readonly = self.readonly;
        param.export = self.export;
        param.group = self.group.clone();
        if let Some(initial) = &self.initial {
            param = param.initial(initial.clone());
        }
        if let Some(constant) = &self.constant {
            param = param.constant(constant.clone());
        }
        param
    }
}

/// A `[[modules.commands]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Argument type
    #[serde(default)]
    pub argument: Option<DataType>,
    /// Result type
    #[serde(default)]
    pub result: Option<DataType>,
}

impl CommandConfig {
    fn build(&self) -> Command {
        let mut command = Command::new(&self.name);
        command.description = self.description.clone();
        command.argument = self.argument.clone();
        command.result = self.result.clone();
        command
    }
}

/// A `[[modules]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Module name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Interface classes, most specific first
    #[serde(default)]
    pub interface_classes: Vec<String>,
    /// Base poll interval in seconds
    #[serde(default)]
    pub pollinterval: Option<f64>,
    /// Poller this module is polled by
    #[serde(default)]
    pub poll_group: Option<String>,
    /// Extra module properties
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Parameters
    #[serde(default)]
    pub parameters: Vec<ParameterConfig>,
    /// Commands
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

impl ModuleConfig {
    /// Build the module with the stored value driver
    pub fn build(&self) -> Result<Module, ConfigError> {
        let mut builder = Module::builder(&self.name).description(&self.description);
        for class in &self.interface_classes {
            builder = builder.interface_class(class);
        }
        if let Some(interval) = self.pollinterval {
            builder = builder.pollinterval(interval);
        }
        if let Some(group) = &self.poll_group {
            builder = builder.poll_group(group);
        }
        for (key, value) in &self.properties {
            builder = builder.property(key, value.clone());
        }
        for param in &self.parameters {
            builder = builder.parameter(param.build());
        }
        for command in &self.commands {
            builder = builder.command(command.build());
        }
        Ok(builder.build()?)
    }
}

/// A whole node configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node settings
    pub node: NodeSection,
    /// Router settings; the node routes when present
    #[serde(default)]
    pub router: Option<RouterSection>,
    /// Local modules
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl FromStr for NodeConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl NodeConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Load from `path`, or from the default location
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = super::default_config_path().ok_or(ConfigError::NotFound)?;
                Self::load(&path)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.name.as_str()) {
                return Err(RegistryError::DuplicateModule(module.name.clone()).into());
            }
            module.build()?;
        }
        if let Some(router) = &self.router {
            router.uris()?;
        }
        Ok(())
    }

    /// Node level description
    pub fn node_info(&self) -> NodeInfo {
        let mut info = NodeInfo::new(&self.node.equipment_id, &self.node.description);
        info.properties = self.node.properties.clone();
        info
    }

    /// Handler settings for every interface
    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            detailed_errors: self.node.detailed_errors,
        }
    }

    /// Build all local modules
    pub fn build_modules(&self) -> Result<Vec<Module>, ConfigError> {
        self.modules.iter().map(ModuleConfig::build).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[node]
equipment_id = "demo.psi.ch"
description = "demo node"
interfaces = ["tcp://10767", "ws://10768"]
detailed_errors = false

[node.properties]
_facility = "psi"

[[modules]]
name = "T"
description = "temperature"
interface_classes = ["Drivable", "Readable"]
pollinterval = 2.0

[[modules.parameters]]
name = "value"
datainfo = { type = "double", unit = "K" }
initial = 300.0

[[modules.parameters]]
name = "target"
datainfo = { type = "double", min = 0, max = 400, unit = "K" }
readonly = false

[[modules.parameters]]
name = "mode"
datainfo = { type = "enum", members = { off = 0, on = 1 } }
constant = 1

[[modules.commands]]
name = "stop"
"#;

    #[test]
    fn test_parse_sample() {
        let config: NodeConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.node.interfaces, [Interface::tcp(10767), Interface::ws(10768)]);
        assert!(!config.handler_options().detailed_errors);
        assert_eq!(config.node.startup_timeout, 30.0);
        assert!(config.router.is_none());
        assert_eq!(config.node_info().properties["_facility"], "psi");

        let modules = config.build_modules().unwrap();
        let module = &modules[0];
        assert_eq!(module.name(), "T");
        assert_eq!(module.pollinterval(), 2.0);
        assert!(module.parameter("target").is_ok());
        let desc = module.describe();
        assert_eq!(desc["interface_classes"][0], "Drivable");
        assert_eq!(desc["accessibles"]["mode"]["constant"], 1);
        assert_eq!(desc["accessibles"]["target"]["datainfo"]["max"], 400.0);
    }

    #[test]
    fn test_defaults() {
        let config: NodeConfig = "[node]\nequipment_id = \"x\"\n".parse().unwrap();
        assert_eq!(config.node.interfaces, [Interface::tcp(10767)]);
        assert!(config.node.detailed_errors);
        assert!(!config.node.discovery);
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_invalid_names_and_duplicates() {
        let bad = "[node]\nequipment_id = \"x\"\n[[modules]]\nname = \"1T\"\n";
        assert!(matches!(bad.parse::<NodeConfig>(), Err(ConfigError::Registry(_))));

        let dup = "[node]\nequipment_id = \"x\"\n[[modules]]\nname = \"T\"\n[[modules]]\nname = \"T\"\n";
        assert!(matches!(
            dup.parse::<NodeConfig>(),
            Err(ConfigError::Registry(RegistryError::DuplicateModule(_)))
        ));

        let dup_param = r#"
[node]
equipment_id = "x"
[[modules]]
name = "T"
[[modules.parameters]]
name = "value"
datainfo = { type = "bool" }
[[modules.parameters]]
name = "value"
datainfo = { type = "bool" }
"#;
        assert!(matches!(
            dup_param.parse::<NodeConfig>(),
            Err(ConfigError::Registry(RegistryError::DuplicateAccessible { .. }))
        ));
    }

    #[test]
    fn test_bad_interface_scheme() {
        let bad = "[node]\nequipment_id = \"x\"\ninterfaces = [\"udp://1\"]\n";
        assert!(matches!(bad.parse::<NodeConfig>(), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_router_section() {
        let both = "[node]\nequipment_id = \"x\"\n[router]\nnode = \"a:1\"\nnodes = [\"b:2\"]\n";
        assert!(matches!(both.parse::<NodeConfig>(), Err(ConfigError::NodeAndNodes)));
        let none = "[node]\nequipment_id = \"x\"\n[router]\n";
        assert!(matches!(none.parse::<NodeConfig>(), Err(ConfigError::NoRouterNodes)));
        let one: NodeConfig = "[node]\nequipment_id = \"x\"\n[router]\nnode = \"a:1\"\n"
            .parse()
            .unwrap();
        assert_eq!(one.router.unwrap().uris().unwrap(), ["a:1"]);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = NodeConfig::load(file.path()).unwrap();
        assert_eq!(config.node.equipment_id, "demo.psi.ch");

        let missing = NodeConfig::load(Path::new("/nonexistent/secnode.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
