use std::{error::Error, fs, io, path::Path, path::PathBuf};

use ::config::{Config, Environment};
use ron::{extensions::Extensions, ser::PrettyConfig, Options};
use serde::{Deserialize, Serialize};

use crate::{
    datapoint::WireFormat,
    timer::{TimerBackendKind, DEFAULT_PREFIX},
};

pub const ENV_PREFIX: &str = "DSERV";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DservConfig {
    pub host: String,
    /// Command and streaming port
    pub port: u16,
    /// HTTP and websocket port, disabled when `None`
    pub http_port: Option<u16>,
    /// Static files served over HTTP
    pub www: Option<PathBuf>,
    /// Push format of new connections
    pub format: WireFormat,
    /// Requests waiting for the engine
    pub queue_capacity: usize,
    /// Pushes waiting per connection before updates are dropped
    pub push_capacity: usize,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimerConfig {
    pub count: usize,
    pub prefix: String,
    pub backend: TimerBackendKind,
}

impl Default for DservConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4620,
            http_port: Some(2565),
            www: None,
            format: WireFormat::Text,
            queue_capacity: 1024,
            push_capacity: 1024,
            timers: TimerConfig::default(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            count: 8,
            prefix: DEFAULT_PREFIX.to_string(),
            backend: TimerBackendKind::Auto,
        }
    }
}

impl DservConfig {
    /// Reads a RON config file. A missing file gives the defaults.
    pub fn from_file(file_path: impl AsRef<Path>) -> Result<Self, Box<dyn Error>> {
        match fs::read_to_string(file_path) {
            Ok(s) => Self::parse(&s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let options = Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_NEWTYPES);
        Ok(options.from_str(s)?)
    }

    /// Layers `DSERV__*` variables (e.g. `DSERV__TIMERS__COUNT=4`) over this config
    pub fn with_env_overrides(self) -> Result<Self, Box<dyn Error>> {
        self.with_overrides(Environment::with_prefix(ENV_PREFIX))
    }

    fn with_overrides(self, env: Environment) -> Result<Self, Box<dyn Error>> {
        let merged = Config::builder()
            .add_source(Config::try_from(&self)?)
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        Ok(merged.try_deserialize()?)
    }

    pub fn to_ron(&self) -> Result<String, Box<dyn Error>> {
        Ok(ron::ser::to_string_pretty(self, PrettyConfig::default())?)
    }
}
