use crate::config::model::Config;
use anyhow::Context;

/// 从默认路径加载并验证配置
pub fn load_config() -> Result<Config, anyhow::Error> {
    load_config_from_path("harbor.toml")
}

/// 加载即验证：无效配置在启动时失败，而不是等到第一次网络调用
pub fn load_config_from_path(config_path: &str) -> Result<Config, anyhow::Error> {
    let config_str = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file '{config_path}'"))?;
    let config: Config = toml::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file '{config_path}'"))?;
    config
        .validate()
        .with_context(|| format!("Invalid config in '{config_path}'"))?;
    Ok(config)
}
