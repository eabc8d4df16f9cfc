//! Participant configuration model.
//!
//! Parsing (YAML/JSON) happens outside the core; the structured value lands
//! here. Every struct derives `serde` so external loaders can fill it in and
//! status endpoints can echo it back.

use std::time::Duration;

/// How the lifecycle start/stop is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// Wait for cluster consensus (system state / system commands).
    Coordinated,
    /// Drive the state machine locally.
    Autonomous,
}

/// Configuration handed to `create_lifecycle_service`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LifecycleConfiguration {
    pub operation_mode: OperationMode,
}

impl LifecycleConfiguration {
    pub fn coordinated() -> Self {
        Self {
            operation_mode: OperationMode::Coordinated,
        }
    }

    pub fn autonomous() -> Self {
        Self {
            operation_mode: OperationMode::Autonomous,
        }
    }
}

/// Log levels accepted by the logging sink configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// Where a logging sink writes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSinkKind {
    Stdout,
    File,
    /// Ship log lines to remote participants. Accepted for compatibility;
    /// the remote wiring lives outside the core and the sink is ignored
    /// with a warning.
    Remote,
}

/// A single logging sink.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogSinkConfig {
    #[serde(rename = "type")]
    pub kind: LogSinkKind,
    #[serde(default)]
    pub level: LogLevel,
    /// File stem for `File` sinks.
    #[serde(default)]
    pub log_name: Option<String>,
}

/// Logging section of the participant configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_from_remotes: bool,
    pub flush_level: LogLevel,
    pub sinks: Vec<LogSinkConfig>,
}

/// Simulation-step watchdog thresholds.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Step durations beyond this are logged as warnings.
    pub soft_response_timeout: Option<Duration>,
    /// Step durations beyond this are logged as errors.
    pub hard_response_timeout: Option<Duration>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            soft_response_timeout: None,
            hard_response_timeout: None,
        }
    }
}

/// Per-controller configuration block (CAN/LIN/Ethernet/FlexRay).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    /// Overrides the network name given at creation.
    pub network: Option<String>,
}

/// Per-publisher/subscriber/client/server configuration block.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DataOrRpcConfig {
    pub name: String,
    /// Overrides the topic (pub/sub) or function name (RPC).
    pub topic: Option<String>,
    pub function_name: Option<String>,
}

/// The participant configuration as the core receives it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Overrides the name passed at participant creation.
    pub participant_name: Option<String>,
    /// Overrides the registry URI passed at participant creation
    /// (`middleware.registryUri`).
    pub registry_uri: Option<String>,
    pub logging: LoggingConfig,
    pub health_check: HealthCheckConfig,
    pub can_controllers: Vec<ControllerConfig>,
    pub lin_controllers: Vec<ControllerConfig>,
    pub ethernet_controllers: Vec<ControllerConfig>,
    pub flexray_controllers: Vec<ControllerConfig>,
    pub data_publishers: Vec<DataOrRpcConfig>,
    pub data_subscribers: Vec<DataOrRpcConfig>,
    pub rpc_clients: Vec<DataOrRpcConfig>,
    pub rpc_servers: Vec<DataOrRpcConfig>,
}

impl ParticipantConfig {
    /// Effective participant name: configuration wins over the argument.
    pub fn effective_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.participant_name.as_deref().unwrap_or(fallback)
    }

    /// Effective registry URI: configuration wins over the argument.
    pub fn effective_registry_uri<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.registry_uri.as_deref().unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_overrides_win() {
        let mut config = ParticipantConfig::default();
        assert_eq!(config.effective_name("FromArg"), "FromArg");
        config.participant_name = Some("FromConfig".to_string());
        assert_eq!(config.effective_name("FromArg"), "FromConfig");

        config.registry_uri = Some("silkit://registry:8500".to_string());
        assert_eq!(
            config.effective_registry_uri("silkit://localhost:8500"),
            "silkit://registry:8500"
        );
    }

    #[test]
    fn test_default_has_no_sinks() {
        let config = ParticipantConfig::default();
        assert!(config.logging.sinks.is_empty());
        assert_eq!(config.health_check.soft_response_timeout, None);
    }
}
