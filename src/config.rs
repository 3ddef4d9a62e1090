//! Configuration for the mock server.
//!
//! Defines request patterns, response plans, port values and the YAML
//! configuration file consumed by the CLI.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Main configuration loaded by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockServerConfig {
    /// Port to listen on
    #[serde(default)]
    pub port: Option<PortValue>,

    /// Ordered request mappings (first match wins)
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,

    /// Global settings
    #[serde(default)]
    pub settings: ServerSettings,
}

impl MockServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(port) = &self.port {
            port.validate()?;
        }
        for (i, mapping) in self.mappings.iter().enumerate() {
            mapping
                .response
                .validate()
                .map_err(|e| anyhow::anyhow!("Mapping {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// One request pattern / response plan pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingEntry {
    pub request: RequestPattern,
    pub response: ResponsePlan,
}

/// What an inbound request must look like. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestPattern {
    /// HTTP method, compared case-insensitively
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Substring of, or regex over, the request URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Substring of, or regex over, the serialized request body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl RequestPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// How to answer a matched request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResponsePlan {
    /// HTTP status code (200 when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Response headers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Delay before the reply is written, in milliseconds
    #[serde(
        default,
        deserialize_with = "lenient_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_time: Option<u64>,

    /// Never answer; leave the connection open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_timeout: Option<TimeoutFlag>,

    /// Literal body, preferred over `response_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_text: Option<String>,

    /// Path of a file whose content becomes the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_file: Option<String>,
}

impl ResponsePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn response_time(mut self, millis: u64) -> Self {
        self.response_time = Some(millis);
        self
    }

    pub fn timeout(mut self, flag: impl Into<TimeoutFlag>) -> Self {
        self.is_timeout = Some(flag.into());
        self
    }

    pub fn response_text(mut self, text: impl Into<String>) -> Self {
        self.response_text = Some(text.into());
        self
    }

    pub fn response_file(mut self, path: impl Into<String>) -> Self {
        self.response_file = Some(path.into());
        self
    }

    /// Whether this plan simulates a hung backend.
    pub fn simulates_timeout(&self) -> bool {
        self.is_timeout.as_ref().is_some_and(TimeoutFlag::is_set)
    }

    /// Validate the response plan.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(status) = self.status {
            if !(100..=599).contains(&status) {
                anyhow::bail!("Invalid status code: {}", status);
            }
        }
        Ok(())
    }
}

/// `isTimeout` accepts either a boolean or the strings `"true"` / `"false"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeoutFlag {
    Bool(bool),
    Text(String),
}

impl TimeoutFlag {
    pub fn is_set(&self) -> bool {
        match self {
            TimeoutFlag::Bool(flag) => *flag,
            TimeoutFlag::Text(text) => text == "true",
        }
    }
}

impl From<bool> for TimeoutFlag {
    fn from(flag: bool) -> Self {
        TimeoutFlag::Bool(flag)
    }
}

impl From<&str> for TimeoutFlag {
    fn from(text: &str) -> Self {
        TimeoutFlag::Text(text.to_string())
    }
}

/// Anything that is not a non-negative integer counts as "no delay".
fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| v.as_u64()))
}

/// A port given either as a number or as a numeric string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(i64),
    Text(String),
}

impl PortValue {
    pub const MIN: u16 = 1025;
    pub const MAX: u16 = 49151;

    /// Resolve to a port in `[MIN, MAX]`.
    pub fn validate(&self) -> Result<u16> {
        let number = match self {
            PortValue::Number(n) => Some(*n),
            PortValue::Text(text) => text.trim().parse::<i64>().ok(),
        };
        match number {
            Some(n) if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&n) => Ok(n as u16),
            _ => Err(Error::InvalidPort(self.to_string())),
        }
    }
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(text) => f.write_str(text),
        }
    }
}

macro_rules! port_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for PortValue {
            fn from(n: $ty) -> Self {
                i64::try_from(n).map(PortValue::Number).unwrap_or_else(|_| PortValue::Text(n.to_string()))
            }
        })*
    };
}

port_from_int!(u16, u32, u64, i32, i64, usize);

impl From<&str> for PortValue {
    fn from(text: &str) -> Self {
        PortValue::Text(text.to_string())
    }
}

impl From<String> for PortValue {
    fn from(text: String) -> Self {
        PortValue::Text(text)
    }
}

/// Global settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Address the listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Log all matched mappings
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Base directory for relative `responseFile` paths
    #[serde(default)]
    pub response_dir: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            log_matches: true,
            log_unmatched: true,
            response_dir: None,
        }
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_true() -> bool {
    true
}
