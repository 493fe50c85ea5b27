use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub store: StoreSettings,
    pub probe: ProbeSettings,
    pub servers: ServerSettings,
    #[serde(default)]
    pub settings: GlobalSettings,
}

/// 池存储（外部数据库）访问配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreSettings {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_store_timeout")]
    pub timeout_seconds: u64,
}

/// 凭证健康探测配置
/// services 是固定的能力检查清单，候选凭证必须全部通过才算健康
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeSettings {
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    pub services: Vec<ProbeService>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeService {
    pub name: String,
    pub url: String,
}

/// 后端服务器配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerSettings {
    /// 运营账号专用的保留服务器标识
    pub reserved: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GlobalSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// 分配成功后进入欢迎界面前的展示延迟
    #[serde(default = "default_welcome_delay")]
    pub welcome_delay_ms: u64,
    /// 静默重分配的最大尝试次数（见 DESIGN.md）
    #[serde(default = "default_silent_retry_limit")]
    pub silent_retry_limit: u32,
    #[serde(default = "default_silent_retry_backoff")]
    pub silent_retry_backoff_seconds: u64,
    /// 本地开发环境下登录后跳过服务器选择
    #[serde(default)]
    pub local_dev: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            welcome_delay_ms: default_welcome_delay(),
            silent_retry_limit: default_silent_retry_limit(),
            silent_retry_backoff_seconds: default_silent_retry_backoff(),
            local_dev: false,
        }
    }
}

// Default value functions
fn default_store_timeout() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_welcome_delay() -> u64 {
    1500
}

fn default_silent_retry_limit() -> u32 {
    3
}

fn default_silent_retry_backoff() -> u64 {
    30
}

impl Config {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        self.validate_store()?;
        self.validate_probe()?;
        self.validate_servers()?;
        self.validate_settings()?;
        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.base_url.is_empty() {
            anyhow::bail!("Store has empty base_url");
        }

        if !self.store.base_url.starts_with("http://") && !self.store.base_url.starts_with("https://") {
            anyhow::bail!(
                "Store has invalid base_url format: '{}'. Must start with http:// or https://",
                self.store.base_url
            );
        }

        if self.store.api_key.is_empty() {
            anyhow::bail!("Store has empty api_key");
        }

        if self.store.api_key.len() < 10 {
            anyhow::bail!("Store has API key that is too short (minimum 10 characters)");
        }

        if self.store.timeout_seconds == 0 {
            anyhow::bail!("Store has invalid timeout_seconds: cannot be 0");
        }

        if self.store.timeout_seconds > 300 {
            anyhow::bail!(
                "Store has timeout_seconds too large: {} (maximum 300 seconds)",
                self.store.timeout_seconds
            );
        }

        Ok(())
    }

    fn validate_probe(&self) -> Result<()> {
        if self.probe.services.is_empty() {
            anyhow::bail!("Probe has no services defined; at least one capability check is required");
        }

        for service in &self.probe.services {
            if service.name.is_empty() {
                anyhow::bail!("Probe service has empty name");
            }

            if !service.url.starts_with("http://") && !service.url.starts_with("https://") {
                anyhow::bail!(
                    "Probe service '{}' has invalid url format: '{}'. Must start with http:// or https://",
                    service.name,
                    service.url
                );
            }
        }

        if self.probe.timeout_seconds == 0 {
            anyhow::bail!("Probe has invalid timeout_seconds: cannot be 0");
        }

        if self.probe.timeout_seconds > 120 {
            anyhow::bail!(
                "Probe has timeout_seconds too large: {} (maximum 120 seconds)",
                self.probe.timeout_seconds
            );
        }

        Ok(())
    }

    fn validate_servers(&self) -> Result<()> {
        if self.servers.reserved.is_empty() {
            anyhow::bail!("Servers has empty reserved identifier");
        }

        if self.servers.reserved.contains(' ') {
            anyhow::bail!(
                "Servers has invalid reserved identifier: '{}' (cannot contain spaces)",
                self.servers.reserved
            );
        }

        Ok(())
    }

    fn validate_settings(&self) -> Result<()> {
        if self.settings.heartbeat_interval_seconds == 0 {
            anyhow::bail!("Settings has invalid heartbeat_interval_seconds: cannot be 0");
        }

        if self.settings.silent_retry_limit > 10 {
            anyhow::bail!(
                "Settings has silent_retry_limit too large: {} (maximum 10)",
                self.settings.silent_retry_limit
            );
        }

        if self.settings.welcome_delay_ms > 10_000 {
            anyhow::bail!(
                "Settings has welcome_delay_ms too large: {} (maximum 10000)",
                self.settings.welcome_delay_ms
            );
        }

        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.settings.heartbeat_interval_seconds)
    }

    pub fn welcome_delay(&self) -> Duration {
        Duration::from_millis(self.settings.welcome_delay_ms)
    }

    pub fn silent_retry_backoff(&self) -> Duration {
        Duration::from_secs(self.settings.silent_retry_backoff_seconds)
    }
}
