use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the shim
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Gateway process configuration
    pub gateway: GatewayConfig,

    /// Remote storage configuration (mount + sync disabled when absent)
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API write operations
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum time to wait for a gateway response before returning 504
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

/// Configuration for the gateway process this shim fronts
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Command to execute to start the gateway
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Local port the gateway listens on
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Process name to look for in the process list (default: command basename)
    pub process_name: Option<String>,

    /// Substring the gateway prints once it is serving (matched case-insensitively)
    #[serde(default = "default_startup_marker")]
    pub startup_marker: String,

    /// Cold-start timeout in seconds (default: 90)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Development-mode flag, forwarded to the gateway environment
    pub dev_mode: Option<bool>,

    /// Gateway access token, forwarded to the gateway environment
    pub auth_token: Option<String>,

    /// Sleep timeout in seconds, forwarded to the gateway environment
    pub sleep_timeout_secs: Option<u64>,

    /// Gateway-management CLI (may include leading arguments, e.g. "npx gateway-cli")
    #[serde(default = "default_cli_command")]
    pub cli_command: String,

    /// Timeout for CLI operations in seconds (default: 30)
    #[serde(default = "default_cli_timeout")]
    pub cli_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn cli_timeout(&self) -> Duration {
        Duration::from_secs(self.cli_timeout_secs)
    }

    /// Name used to look for an already-running gateway in the process list
    pub fn process_name(&self) -> String {
        if let Some(ref name) = self.process_name {
            return name.clone();
        }
        Path::new(&self.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.command.clone())
    }
}

/// Remote object-storage configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Bucket name
    pub bucket: String,

    /// Bucket access key
    #[serde(default)]
    pub access_key: String,

    /// Bucket secret key
    #[serde(default)]
    pub secret_key: String,

    /// Local path the bucket is mounted at
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Local data directory synchronized into the mount
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Command used to mount the bucket (sandbox-provided)
    #[serde(default = "default_mount_command")]
    pub mount_command: String,

    /// File-sync command (rsync-compatible flags)
    #[serde(default = "default_sync_command")]
    pub sync_command: String,

    /// Extra arguments appended to the sync command
    #[serde(default)]
    pub sync_extra_args: Vec<String>,

    /// Interval between scheduled syncs in seconds (default: 300)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Timeout for a single sync run in seconds (default: 120)
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

impl StorageConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9187
}

fn default_request_timeout() -> u64 {
    60
}

fn default_gateway_port() -> u16 {
    8800
}

fn default_startup_marker() -> String {
    "listening".to_string()
}

fn default_startup_timeout() -> u64 {
    90
}

fn default_cli_command() -> String {
    "gateway-cli".to_string()
}

fn default_cli_timeout() -> u64 {
    30
}

fn default_mount_path() -> String {
    "/mnt/bucket".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_mount_command() -> String {
    "bucket-mount".to_string()
}

fn default_sync_command() -> String {
    "rsync".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn default_sync_timeout() -> u64 {
    120
}

impl Config {
    /// Load configuration from a TOML file and overlay the documented
    /// environment variables on top of it
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!(
                "Failed to parse config file {}: {}",
                path.as_ref().display(),
                e
            )
        })?;
        config.apply_env_overrides(std::env::vars());
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overlay)
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Overlay the external environment variables this shim consumes.
    ///
    /// Values from the environment win over the config file so that
    /// credentials never have to live on disk.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "DEV_MODE" => {
                    self.gateway.dev_mode = Some(truthy(&value));
                }
                "GATEWAY_TOKEN" => {
                    self.gateway.auth_token = Some(value);
                }
                "SLEEP_TIMEOUT_SECS" => {
                    if let Ok(secs) = value.parse() {
                        self.gateway.sleep_timeout_secs = Some(secs);
                    }
                }
                "STORAGE_BUCKET" => {
                    if let Some(ref mut storage) = self.storage {
                        storage.bucket = value;
                    }
                }
                "STORAGE_ACCESS_KEY" => {
                    if let Some(ref mut storage) = self.storage {
                        storage.access_key = value;
                    }
                }
                "STORAGE_SECRET_KEY" => {
                    if let Some(ref mut storage) = self.storage {
                        storage.secret_key = value;
                    }
                }
                _ => {}
            }
        }
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [gateway]
        command = "gatewayd"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9187);
        assert_eq!(config.gateway.command, "gatewayd");
        assert_eq!(config.gateway.port, 8800);
        assert_eq!(config.gateway.startup_marker, "listening");
        assert_eq!(config.gateway.startup_timeout(), Duration::from_secs(90));
        assert!(config.gateway.dev_mode.is_none());
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9090
            admin_port = 9191
            request_timeout_secs = 30

            [gateway]
            command = "/usr/local/bin/gatewayd"
            args = ["--verbose"]
            port = 7000
            startup_marker = "gateway up"
            dev_mode = true
            auth_token = "secret"

            [storage]
            bucket = "backups"
            access_key = "AK"
            secret_key = "SK"
            mount_path = "/mnt/backups"
            data_dir = "/srv/data"
            sync_interval_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.gateway.args, vec!["--verbose"]);
        assert_eq!(config.gateway.dev_mode, Some(true));
        let storage = config.storage.unwrap();
        assert_eq!(storage.bucket, "backups");
        assert_eq!(storage.sync_interval(), Duration::from_secs(60));
        assert_eq!(storage.sync_command, "rsync");
    }

    #[test]
    fn test_process_name_defaults_to_command_basename() {
        let config = Config::from_toml(
            r#"
            [gateway]
            command = "/opt/gateway/bin/gatewayd"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.process_name(), "gatewayd");

        let config = Config::from_toml(
            r#"
            [gateway]
            command = "gatewayd"
            process_name = "gateway-main"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.process_name(), "gateway-main");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml(
            r#"
            [gateway]
            command = "gatewayd"
            auth_token = "from-file"

            [storage]
            bucket = "from-file"
            "#,
        )
        .unwrap();

        config.apply_env_overrides(vec![
            ("DEV_MODE".to_string(), "true".to_string()),
            ("GATEWAY_TOKEN".to_string(), "from-env".to_string()),
            ("SLEEP_TIMEOUT_SECS".to_string(), "600".to_string()),
            ("STORAGE_ACCESS_KEY".to_string(), "AK-env".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ]);

        assert_eq!(config.gateway.dev_mode, Some(true));
        assert_eq!(config.gateway.auth_token.as_deref(), Some("from-env"));
        assert_eq!(config.gateway.sleep_timeout_secs, Some(600));
        let storage = config.storage.unwrap();
        assert_eq!(storage.access_key, "AK-env");
        assert_eq!(storage.bucket, "from-file");
    }

    #[test]
    fn test_env_overrides_ignore_bad_values() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.apply_env_overrides(vec![(
            "SLEEP_TIMEOUT_SECS".to_string(),
            "not-a-number".to_string(),
        )]);
        assert!(config.gateway.sleep_timeout_secs.is_none());

        // Storage env vars are ignored when no storage section is configured
        config.apply_env_overrides(vec![("STORAGE_BUCKET".to_string(), "b".to_string())]);
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_truthy() {
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("TRUE"));
        assert!(truthy("yes"));
        assert!(!truthy("0"));
        assert!(!truthy("false"));
        assert!(!truthy(""));
    }
}
