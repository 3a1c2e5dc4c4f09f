use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::llm::ProviderKind;

/** \brief 工作目录下默认读取的配置文件。 */
pub const CONFIG_FILE: &str = "easychat.toml";
/** \brief 环境变量前缀，嵌套字段以 `__` 分隔。 */
pub const ENV_PREFIX: &str = "EASYCHAT_";

/**
 * \brief 应用配置：存储、HTTP 服务、鉴权、日志与模型服务列表。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub bind_addr: String,
    pub cors_origins: Vec<String>,
    pub default_provider: String,
    pub default_model: String,
    /** \brief 单次模型服务调用的超时（秒）。 */
    pub request_timeout_secs: u64,
    pub max_upload_bytes: usize,
    /** \brief 是否允许附件引用上传目录以外的本地文件（仅供本机 CLI 使用）。 */
    pub local_attachments: bool,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sessions.db"),
            upload_dir: PathBuf::from("uploads"),
            bind_addr: "0.0.0.0:8000".to_string(),
            cors_origins: vec!["http://localhost:3000".to_string()],
            default_provider: "openai".to_string(),
            default_model: "gpt-3.5-turbo".to_string(),
            request_timeout_secs: 60,
            max_upload_bytes: 20 * 1024 * 1024,
            local_attachments: false,
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            providers: Vec::new(),
        }
    }
}

/**
 * \brief 全局共享凭据（HTTP Basic）。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /** \brief 未设置 RUST_LOG 时使用的过滤级别。 */
    pub level: String,
    /** \brief 是否额外写入日志文件。 */
    pub file: bool,
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            dir: PathBuf::from("logs"),
        }
    }
}

/**
 * \brief 单个模型服务的配置项。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: String,
    /** \brief API 基地址，缺省时使用该类型的官方地址。 */
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
    /** \brief 覆盖默认调用参数（temperature、max_tokens 等）。 */
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl AppConfig {
    /**
     * \brief 按优先级合并配置：内置默认值 < 旧版环境变量 < TOML 文件 < EASYCHAT_ 环境变量。
     * \param path 显式配置文件路径；为空时尝试工作目录下的 easychat.toml。
     */
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Env::raw().only(&["default_model", "default_provider"]));

        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if Path::new(CONFIG_FILE).exists() {
                    figment = figment.merge(Toml::file(CONFIG_FILE));
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        let mut config = Self::from_figment(figment)?;
        config.apply_legacy_provider(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        figment.extract().context("invalid configuration")
    }

    /**
     * \brief 未配置任何模型服务时，从 OPENAI_API_KEY / OPENAI_API_BASE 构造单个 OpenAI 服务。
     */
    pub fn apply_legacy_provider<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.providers.is_empty() {
            return;
        }
        let Some(api_key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) else {
            return;
        };
        self.providers.push(ProviderConfig {
            name: self.default_provider.clone(),
            kind: ProviderKind::OpenAI,
            api_key,
            api_base: lookup("OPENAI_API_BASE").filter(|b| !b.trim().is_empty()),
            models: vec![self.default_model.clone()],
            params: BTreeMap::new(),
        });
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                bail!("provider name must not be empty");
            }
            if !seen.insert(provider.name.as_str()) {
                bail!("duplicate provider name {}", provider.name);
            }
        }
        if self.auth.enabled && (self.auth.username.is_empty() || self.auth.password.is_empty()) {
            bail!("auth is enabled but username or password is empty");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs cannot be 0");
        }
        Ok(())
    }
}
