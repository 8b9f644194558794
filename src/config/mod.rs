//! 统一配置系统
//!
//! 提供TOML/JSON配置文件、环境变量和运行时校验
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, LogLevel, LoggingConfig};

use crate::core::error::BridgeError;
use crate::impl_default;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 文件读取错误
    #[error("Config file error: {0}")]
    FileError(#[from] std::io::Error),
    /// 解析错误
    #[error("Config parse error: {0}")]
    ParseError(String),
    /// 验证错误
    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

/// 脚本桥配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// 编解码时允许的最大嵌套深度
    pub max_depth: usize,

    /// 只加载安全的标准库 (coroutine, table, string, utf8, math)
    pub sandbox: bool,

    /// 单次宿主调用允许执行的虚拟机指令数，None 表示不限制
    pub instruction_limit: Option<u64>,

    /// 计数钩子的触发间隔（指令数）
    pub hook_interval: u32,

    /// 把脚本中的 print 重定向到 tracing
    pub capture_print: bool,

    /// 日志配置
    pub logging: LoggingConfig,
}

impl_default!(BridgeConfig {
    max_depth: 64,
    sandbox: false,
    instruction_limit: None,
    hook_interval: 1000,
    capture_print: true,
    logging: LoggingConfig::default(),
});

impl BridgeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从TOML文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(ConfigError::FileError)?;
        Self::from_json_str(&content)
    }

    /// 从JSON字符串解析配置
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 保存为TOML文件
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 保存为JSON文件
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 从环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LUA_BRIDGE_MAX_DEPTH") {
            if let Ok(depth) = val.parse() {
                self.max_depth = depth;
            }
        }
        if let Ok(val) = env::var("LUA_BRIDGE_SANDBOX") {
            self.sandbox = val.parse().unwrap_or(self.sandbox);
        }
        if let Ok(val) = env::var("LUA_BRIDGE_INSTRUCTION_LIMIT") {
            match val.trim() {
                "" | "off" | "none" => self.instruction_limit = None,
                other => {
                    if let Ok(limit) = other.parse() {
                        self.instruction_limit = Some(limit);
                    }
                }
            }
        }
        if let Ok(val) = env::var("LUA_BRIDGE_HOOK_INTERVAL") {
            if let Ok(interval) = val.parse() {
                self.hook_interval = interval;
            }
        }
        if let Ok(val) = env::var("LUA_BRIDGE_CAPTURE_PRINT") {
            self.capture_print = val.parse().unwrap_or(self.capture_print);
        }
        if let Ok(val) = env::var("LUA_BRIDGE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                self.logging.level = level;
            }
        }
    }

    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_depth must be at least 1".to_string(),
            ));
        }
        if self.hook_interval == 0 {
            return Err(ConfigError::ValidationError(
                "hook_interval must be at least 1".to_string(),
            ));
        }
        if self.instruction_limit == Some(0) {
            return Err(ConfigError::ValidationError(
                "instruction_limit must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// 自动查找并加载配置文件
    ///
    /// 按以下顺序查找：
    /// 1. ./lua_bridge.toml
    /// 2. ./lua_bridge.json
    /// 3. <config_dir>/lua_bridge/config.toml
    /// 4. 使用默认配置
    pub fn load_or_default() -> Self {
        if let Ok(config) = Self::from_toml_file("lua_bridge.toml") {
            tracing::info!(target: "script_bridge", "Loaded config from lua_bridge.toml");
            return config;
        }

        if let Ok(config) = Self::from_json_file("lua_bridge.json") {
            tracing::info!(target: "script_bridge", "Loaded config from lua_bridge.json");
            return config;
        }

        if let Some(dir) = dirs::config_dir() {
            let config_path = dir.join("lua_bridge").join("config.toml");
            if let Ok(config) = Self::from_toml_file(&config_path) {
                tracing::info!(target: "script_bridge", "Loaded config from {:?}", config_path);
                return config;
            }
        }

        tracing::debug!(target: "script_bridge", "Using default configuration");
        Self::default()
    }
}
