use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorOptions;
use crate::backend::loopback::LoopbackConfig;
use crate::dispatcher::{DispatchOptions, DEFAULT_TIMEOUT};

/// Environment variable naming a configuration file.
pub const CONFIG_ENV: &str = "GPIBTOOL_CONFIG";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Loopback,
    Prologix,
    Visa,
}

impl BackendKind {
    pub const NAMES: [&'static str; 3] = ["loopback", "prologix", "visa"];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Loopback => "loopback",
            BackendKind::Prologix => "prologix",
            BackendKind::Visa => "visa",
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "visa") {
            BackendKind::Visa
        } else if cfg!(feature = "prologix") {
            BackendKind::Prologix
        } else {
            BackendKind::Loopback
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loopback" => Ok(BackendKind::Loopback),
            "prologix" => Ok(BackendKind::Prologix),
            "visa" => Ok(BackendKind::Visa),
            _ => Err(anyhow!("unknown backend `{}`", s)),
        }
    }
}

/// Settings of a Prologix GPIB-USB controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrologixConfig {
    /// Serial port the controller is attached to.
    pub port: String,
    pub baud_rate: u32,
    /// Board index the controller's resources are reported under.
    pub board: u16,
    /// Primary addresses to probe when enumerating.
    pub listeners: Vec<u8>,
}

impl Default for PrologixConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            board: 0,
            listeners: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub backend: BackendKind,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    pub write_termination: String,
    pub read_termination: String,
    pub keep_asrl: bool,
    pub concurrency: usize,
    pub trace_io: bool,
    pub loopback: LoopbackConfig,
    pub prologix: PrologixConfig,
}

impl Default for Config {
    fn default() -> Self {
        let dispatch = DispatchOptions::default();
        Self {
            backend: Default::default(),
            timeout: DEFAULT_TIMEOUT,
            open_timeout: DEFAULT_TIMEOUT,
            write_termination: dispatch.write_termination,
            read_termination: dispatch.read_termination,
            keep_asrl: false,
            concurrency: 1,
            trace_io: false,
            loopback: Default::default(),
            prologix: Default::default(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let ret: Config = toml::from_str(text).context("Invalid configuration")?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading configuration from {}", path.display());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("In {}", path.display()))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("`timeout` must be positive"));
        }
        if self.open_timeout.is_zero() {
            return Err(anyhow!("`open_timeout` must be positive"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("`concurrency` must be at least 1"));
        }
        Ok(())
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            timeout: self.timeout,
            write_termination: self.write_termination.clone(),
            read_termination: self.read_termination.clone(),
            trace_io: self.trace_io,
        }
    }

    pub fn aggregator_options(&self) -> AggregatorOptions {
        AggregatorOptions {
            open_timeout: self.open_timeout,
            concurrency: self.concurrency,
            keep_serial: self.keep_asrl,
        }
    }
}
