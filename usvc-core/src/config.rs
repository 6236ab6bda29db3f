use std::{fs, path::Path};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::http::DEFAULT_MAX_REQUEST_SIZE;

// MAX configuration file size: 16 MB
const MAX_CONFIG_FILE_SIZE: u64 = 16 * 1024 * 1024;
// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

pub const DEFAULT_PORT: u16 = 8080;
pub const MIN_PORT: u16 = 1024;
pub const PORT_ENV: &str = "PORT";

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Threads each running an accept loop and its sessions on a shared port.
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
    /// Threads running the handler. `0` runs it on the I/O thread.
    #[serde(default)]
    pub handler_threads: usize,
    #[serde(default)]
    pub fault_policy: FaultPolicy,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_request_size: default_max_request_size(),
            io_threads: default_io_threads(),
            handler_threads: 0,
            fault_policy: FaultPolicy::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

define_const!(default_port, DEFAULT_PORT, u16);
define_const!(default_max_request_size, DEFAULT_MAX_REQUEST_SIZE, usize);
define_const!(default_io_threads, 1, usize);

/// What the runner does when a session reports a handler fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPolicy {
    /// Log the fault and keep serving.
    #[default]
    Log,
    /// Stop serving and return the fault.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_entries")]
    pub entries: u32,
    #[serde(default)]
    pub runtime_type: RuntimeType,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            entries: default_entries(),
            runtime_type: Default::default(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

define_const!(default_entries, DEFAULT_ENTRIES, u32);
define_const!(default_cpu_affinity, false, bool);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    IoUring,
    Legacy,
}

impl Default for RuntimeType {
    #[cfg(target_os = "linux")]
    fn default() -> Self {
        Self::IoUring
    }
    #[cfg(not(target_os = "linux"))]
    fn default() -> Self {
        Self::Legacy
    }
}

impl ServerConfig {
    /// Load a TOML or JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Self::from_slice(&read_file(path.as_ref())?)
    }

    pub fn from_slice(content: &[u8]) -> anyhow::Result<Self> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        let config = match is_json {
            true => serde_json::from_slice::<Self>(content)?,
            false => toml::from_str::<Self>(&String::from_utf8_lossy(content))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_request_size == 0 {
            bail!("Config: max_request_size must be positive");
        }
        if self.io_threads == 0 {
            bail!("Config: io_threads must be positive");
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) => bail!("Config: error open file: {:?}", e),
    };
    if size > MAX_CONFIG_FILE_SIZE {
        bail!("Config: max file size: {}", MAX_CONFIG_FILE_SIZE);
    }
    Ok(fs::read(path)?)
}

/// Listening port from the `PORT` environment variable.
///
/// Falls back to 8080 when the variable is unset, not a number or outside
/// `1024..=65535`.
pub fn port_from_env() -> u16 {
    parse_port(std::env::var(PORT_ENV).ok().as_deref())
}

pub fn parse_port(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|port| *port >= MIN_PORT)
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "port": 9000,
                "io_threads": 2,
                "handler_threads": 4,
                "fault_policy": "shutdown",
                "runtime": {"runtime_type": "legacy", "entries": 1024}
            }
        "#;

        let config = ServerConfig::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.io_threads, 2);
        assert_eq!(config.handler_threads, 4);
        assert_eq!(config.fault_policy, FaultPolicy::Shutdown);
        assert_eq!(config.runtime.runtime_type, RuntimeType::Legacy);
        assert_eq!(config.runtime.entries, 1024);
        assert!(!config.runtime.cpu_affinity);
        assert_eq!(config.max_request_size, DEFAULT_MAX_REQUEST_SIZE);
    }

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = "
            port = 8081
            max_request_size = 4096

            [runtime]
            cpu_affinity = true
        ";

        let config = ServerConfig::from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.max_request_size, 4096);
        assert_eq!(config.io_threads, 1);
        assert_eq!(config.handler_threads, 0);
        assert_eq!(config.fault_policy, FaultPolicy::Log);
        assert!(config.runtime.cpu_affinity);
        assert_eq!(config.runtime.entries, DEFAULT_ENTRIES);
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = ServerConfig::from_slice(b"").unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_reject_zero_request_size() {
        assert!(ServerConfig::from_slice(b"max_request_size = 0").is_err());
        assert!(ServerConfig::from_slice(b"io_threads = 0").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(ServerConfig::load("/nonexistent/usvc.toml").is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port(None), 8080);
        assert_eq!(parse_port(Some("9090")), 9090);
        assert_eq!(parse_port(Some("65535")), 65535);
        assert_eq!(parse_port(Some("1024")), 1024);
        assert_eq!(parse_port(Some("1023")), 8080);
        assert_eq!(parse_port(Some("80")), 8080);
        assert_eq!(parse_port(Some("65536")), 8080);
        assert_eq!(parse_port(Some("http")), 8080);
        assert_eq!(parse_port(Some("")), 8080);
    }
}
