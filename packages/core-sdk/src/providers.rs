use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::ChatError;
use crate::llm::{ChatClient, HttpChatClient, ProviderKind};

const DEFAULT_TEMPERATURE: f64 = 0.7;
const DEFAULT_MAX_TOKENS: u64 = 1000;

/**
 * \brief 模型调用参数，按键覆盖默认值。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallParameters(BTreeMap<String, Value>);

impl CallParameters {
    /**
     * \brief 内置默认参数：temperature=0.7，max_tokens=1000。
     */
    pub fn defaults() -> Self {
        let mut params = BTreeMap::new();
        params.insert("temperature".to_string(), json!(DEFAULT_TEMPERATURE));
        params.insert("max_tokens".to_string(), json!(DEFAULT_MAX_TOKENS));
        Self(params)
    }

    pub fn merged(overrides: &BTreeMap<String, Value>) -> Self {
        let mut params = Self::defaults();
        for (key, value) in overrides {
            params.0.insert(key.clone(), value.clone());
        }
        params
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.get("temperature").and_then(Value::as_f64)
    }

    pub fn max_tokens(&self) -> Option<u64> {
        self.get("max_tokens").and_then(Value::as_u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/**
 * \brief 注册表中的一个模型服务；没有可用凭据时 client 为空。
 */
pub struct ProviderEntry {
    pub name: String,
    pub models: Vec<String>,
    pub params: BTreeMap<String, Value>,
    client: Option<Arc<dyn ChatClient>>,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            name: name.into(),
            models,
            params: BTreeMap::new(),
            client: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn is_resolvable(&self) -> bool {
        self.client.is_some()
    }
}

/**
 * \brief 解析结果：客户端句柄与生效参数。
 */
#[derive(Clone)]
pub struct ResolvedProvider {
    pub name: String,
    pub client: Arc<dyn ChatClient>,
    pub params: CallParameters,
}

/**
 * \brief 面向前端的模型服务与模型列表。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCatalog {
    pub providers: Vec<String>,
    pub models: BTreeMap<String, Vec<String>>,
    pub default_provider: String,
    pub default_model: String,
}

/**
 * \brief 模型服务注册表，启动时由配置构建，运行期只读。
 */
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
    default_provider: String,
    default_model: String,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            default_provider: default_provider.into(),
            default_model: default_model.into(),
        }
    }

    pub fn with_provider(mut self, entry: ProviderEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /**
     * \brief 从配置构建注册表；占位或缺失凭据的服务只登记不可调用。
     */
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let mut registry = Self::new(&config.default_provider, &config.default_model);
        for provider in &config.providers {
            let mut entry = ProviderEntry::new(&provider.name, provider.models.clone())
                .with_params(provider.params.clone());
            if is_placeholder_credential(&provider.api_key) {
                warn!(provider = %provider.name, "provider has no usable credential, registered as inert");
            } else {
                let client = HttpChatClient::new(
                    provider.kind,
                    provider.api_base.as_deref(),
                    &provider.api_key,
                    timeout,
                )?;
                entry = entry.with_client(Arc::new(client));
            }
            registry = registry.with_provider(entry);
        }
        info!(
            configured = registry.entries.len(),
            resolvable = registry.entries.iter().filter(|e| e.is_resolvable()).count(),
            "provider registry ready"
        );
        Ok(registry)
    }

    fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /**
     * \brief 解析模型服务：优先使用指定名称，其次回退到默认服务。
     */
    pub fn resolve(&self, provider_name: Option<&str>) -> Result<ResolvedProvider, ChatError> {
        let requested = provider_name.and_then(|name| self.entry(name)).filter(|e| e.is_resolvable());
        let entry = match requested {
            Some(entry) => entry,
            None => self
                .entry(&self.default_provider)
                .filter(|e| e.is_resolvable())
                .ok_or_else(|| {
                    ChatError::Unconfigured(format!(
                        "no credential for provider {}",
                        provider_name.unwrap_or(&self.default_provider)
                    ))
                })?,
        };
        let client = entry
            .client
            .clone()
            .ok_or_else(|| ChatError::Unconfigured(entry.name.clone()))?;
        Ok(ResolvedProvider {
            name: entry.name.clone(),
            client,
            params: CallParameters::merged(&entry.params),
        })
    }

    /**
     * \brief 指定服务的生效参数；未知服务返回默认参数。
     */
    pub fn effective_parameters(&self, provider_name: &str) -> CallParameters {
        self.entry(provider_name)
            .map(|e| CallParameters::merged(&e.params))
            .unwrap_or_else(CallParameters::defaults)
    }

    /**
     * \brief 列出全部已配置服务（无论是否可调用）及其模型。
     */
    pub fn list_available(&self) -> ProviderCatalog {
        let mut providers = Vec::new();
        let mut models = BTreeMap::new();
        for entry in &self.entries {
            providers.push(entry.name.clone());
            models.insert(entry.name.clone(), entry.models.clone());
        }
        if providers.is_empty() {
            providers.push(self.default_provider.clone());
            models.insert(
                self.default_provider.clone(),
                vec![self.default_model.clone()],
            );
        }
        ProviderCatalog {
            providers,
            models,
            default_provider: self.default_provider.clone(),
            default_model: self.default_model.clone(),
        }
    }
}

/**
 * \brief 判断凭据是否为空或明显的占位值。
 */
pub fn is_placeholder_credential(key: &str) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    lower.starts_with("your")
        || (lower.starts_with('<') && lower.ends_with('>'))
        || lower == "changeme"
        || lower == "placeholder"
        || lower.starts_with("sk-xxx")
}
