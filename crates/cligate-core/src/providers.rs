use std::collections::HashMap;

use serde::Serialize;

use crate::config::ProviderConfig;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_MODEL: &str = "ANTHROPIC_MODEL";

const CLAUDE_MODELS: [&str; 8] = [
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
    "claude-3-7-sonnet-20250219",
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

#[derive(Debug, Clone, Serialize)]
pub struct ModelProvider {
    pub name: String,
    pub base_url: String,
    pub supported_models: Vec<String>,
    pub description: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ModelProvider {
    fn builtin(name: &str, base_url: &str, models: &[&str], description: &str) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            supported_models: models.iter().map(|m| m.to_string()).collect(),
            description: Some(description.to_string()),
            api_key: None,
        }
    }

    pub fn supports(&self, model: &str) -> bool {
        self.supported_models.iter().any(|m| m == model)
    }
}

/// Maps model names to Anthropic-compatible endpoints. The CLI is pointed
/// at a provider purely through environment variables.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ModelProvider>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderRegistry {
    pub fn with_defaults() -> Self {
        let providers = vec![
            ModelProvider::builtin(
                "anthropic",
                DEFAULT_BASE_URL,
                &CLAUDE_MODELS,
                "Official Anthropic API",
            ),
            ModelProvider::builtin(
                "moonshot",
                "https://api.moonshot.cn/anthropic/",
                &["kimi-k2-turbo-preview", "kimi-k2-0905-preview"],
                "Moonshot AI Anthropic-compatible API",
            ),
            ModelProvider::builtin(
                "bigmodel",
                "https://open.bigmodel.cn/api/anthropic",
                &["glm-4.5", "glm-4.5-air"],
                "BigModel Anthropic-compatible API",
            ),
            ModelProvider::builtin(
                "deepseek",
                "https://api.deepseek.com/anthropic",
                &["deepseek-chat"],
                "DeepSeek Anthropic-compatible API",
            ),
            ModelProvider::builtin(
                "siliconflow",
                "https://api.siliconflow.cn/",
                &["zai-org/GLM-4.5", "zai-org/GLM-4.5-Air"],
                "SiliconFlow Anthropic-compatible API",
            ),
        ];
        Self { providers }
    }

    /// Built-in providers with configured overrides applied. Unknown names
    /// register new providers (a base URL is then required).
    pub fn from_config(overrides: &HashMap<String, ProviderConfig>) -> Self {
        let mut registry = Self::with_defaults();
        let mut names = overrides.keys().collect::<Vec<_>>();
        names.sort();
        for name in names {
            let cfg = &overrides[name];
            match registry.providers.iter_mut().find(|p| &p.name == name) {
                Some(existing) => {
                    if let Some(base_url) = cfg.base_url.clone().filter(|u| !u.is_empty()) {
                        existing.base_url = base_url;
                    }
                    if cfg.api_key.is_some() {
                        existing.api_key = cfg.api_key.clone();
                    }
                    for model in &cfg.models {
                        if !existing.supports(model) {
                            existing.supported_models.push(model.clone());
                        }
                    }
                    if cfg.description.is_some() {
                        existing.description = cfg.description.clone();
                    }
                }
                None => {
                    let Some(base_url) = cfg.base_url.clone().filter(|u| !u.is_empty()) else {
                        tracing::warn!(provider = %name, "skipping provider without base_url");
                        continue;
                    };
                    registry.register(ModelProvider {
                        name: name.clone(),
                        base_url,
                        supported_models: cfg.models.clone(),
                        description: cfg.description.clone(),
                        api_key: cfg.api_key.clone(),
                    });
                }
            }
        }
        registry
    }

    pub fn register(&mut self, provider: ModelProvider) {
        match self.providers.iter_mut().find(|p| p.name == provider.name) {
            Some(existing) => *existing = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelProvider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn providers(&self) -> &[ModelProvider] {
        &self.providers
    }

    /// First registered provider listing `model`.
    pub fn provider_for_model(&self, model: &str) -> Option<&ModelProvider> {
        self.providers.iter().find(|p| p.supports(model))
    }

    pub fn supported_models(&self) -> Vec<String> {
        let mut models = self
            .providers
            .iter()
            .flat_map(|p| p.supported_models.iter().cloned())
            .collect::<Vec<_>>();
        models.sort();
        models.dedup();
        models
    }

    pub fn is_supported(&self, model: &str) -> bool {
        self.provider_for_model(model).is_some()
    }

    /// Environment overlay for one CLI invocation. Request-supplied values
    /// win over the provider table; the API key is only set when non-empty
    /// so an inherited key is not clobbered.
    pub fn resolve_env(
        &self,
        model: &str,
        custom_base_url: Option<&str>,
        custom_api_key: Option<&str>,
    ) -> HashMap<String, String> {
        let provider = self.provider_for_model(model);
        let base_url = custom_base_url
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| provider.map(|p| p.base_url.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let api_key = custom_api_key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| provider.and_then(|p| p.api_key.clone()))
            .filter(|k| !k.is_empty());

        let mut env = HashMap::new();
        env.insert(ENV_BASE_URL.to_string(), base_url);
        env.insert(ENV_MODEL.to_string(), model.to_string());
        if let Some(api_key) = api_key {
            env.insert(ENV_API_KEY.to_string(), api_key);
        }
        env
    }
}
