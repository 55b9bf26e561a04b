//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Cartwheel configuration, loaded from a JSON5 file with
/// `${ENV_VAR}` substitution applied before parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Seconds without an inbound frame before a session is closed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Inter-word delay of streamed replies, in milliseconds.
    #[serde(default = "default_word_delay_ms")]
    pub word_delay_ms: u64,

    /// Budget for token verification during the handshake, in seconds.
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
}

fn default_port() -> u16 {
    8321
}

fn default_idle_timeout_secs() -> u64 {
    500
}

fn default_word_delay_ms() -> u64 {
    100
}

fn default_auth_timeout_secs() -> u64 {
    2
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: None,
            auth: None,
            tls: None,
            idle_timeout_secs: default_idle_timeout_secs(),
            word_delay_ms: default_word_delay_ms(),
            auth_timeout_secs: default_auth_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "static" (shared token), "http" (remote verifier), or
    /// "none". Default: "static" when a token is configured, else "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,

    /// Verifier endpoint for "http" mode; receives `{token}` and answers a
    /// principal record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_url: Option<String>,
}

impl GatewayAuthConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    pub fn effective_mode(&self) -> &str {
        match self.mode.as_deref() {
            Some(m) => m,
            None if self.token.is_some() || self.token_env.is_some() => "static",
            None if self.verify_url.is_some() => "http",
            None => "none",
        }
    }
}

/// TLS configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM).
    pub cert_path: String,
    /// Path to the TLS private key file (PEM).
    pub key_path: String,
}

// --- Providers ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single OpenAI-compatible provider. The first entry is
/// the default; later entries form the failover chain in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Search engine ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Target size of a merged result set.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Bound on concurrent integration work per engine.
    #[serde(default = "default_engine_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,

    #[serde(default = "default_detail_timeout_secs")]
    pub detail_timeout_secs: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    /// SearXNG-compatible web search endpoint for URL discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_search_key_env: Option<String>,

    /// Cloudflare-bypass proxy for scrape fallback, e.g. a scraping API
    /// that takes the target url as a query parameter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_key_env: Option<String>,

    /// Directory of per-site selector schema files (YAML).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_dir: Option<String>,

    /// Process-wide key for reversible product codes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_code_key_env: Option<String>,

    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

fn default_max_results() -> usize {
    20
}

fn default_engine_concurrency() -> usize {
    10
}

fn default_list_timeout_secs() -> u64 {
    20
}

fn default_detail_timeout_secs() -> u64 {
    30
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            concurrency: default_engine_concurrency(),
            list_timeout_secs: default_list_timeout_secs(),
            detail_timeout_secs: default_detail_timeout_secs(),
            retry: None,
            web_search_url: None,
            web_search_key: None,
            web_search_key_env: None,
            proxy_url: None,
            proxy_key: None,
            proxy_key_env: None,
            schema_dir: None,
            product_code_key: None,
            product_code_key_env: None,
            sites: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn resolve_web_search_key(&self) -> Option<String> {
        resolve_secret_field(&self.web_search_key, &self.web_search_key_env)
    }

    pub fn resolve_proxy_key(&self) -> Option<String> {
        resolve_secret_field(&self.proxy_key, &self.proxy_key_env)
    }

    pub fn resolve_product_code_key(&self) -> Option<String> {
        resolve_secret_field(&self.product_code_key, &self.product_code_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; transient failures only.
    #[serde(default = "default_retry_count")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub factor: f64,
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_retry_count(),
            base_delay_ms: default_retry_base_ms(),
            factor: default_retry_factor(),
        }
    }
}

/// One configured product source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub name: String,
    /// "api", "graphql", "scraping", or "llm_extraction".
    pub kind: String,
    pub base_url: String,

    /// List endpoint template for api/graphql sites; `{query}`, `{page}`,
    /// `{limit}` are substituted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_url: Option<String>,

    /// Detail endpoint template for api sites; `{url}` is substituted with
    /// the percent-encoded product URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,

    /// GraphQL document for graphql sites.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graphql_query: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Selector schema file for scraping sites, relative to `schema_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_file: Option<String>,

    /// Extra URL patterns treated as belonging to this site.
    #[serde(default)]
    pub url_patterns: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl SiteConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

// --- Result cache ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// List cache backend: "memory" (in-process index) or "remote".
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Override list TTL in seconds; default 3600 (memory) / 604800 (remote).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_ttl_secs: Option<u64>,

    #[serde(default = "default_detail_ttl_secs")]
    pub detail_ttl_secs: u64,

    /// Max entries held by the in-process list index before FIFO eviction.
    #[serde(default = "default_list_max_entries")]
    pub max_entries: usize,

    /// Directory of the on-disk detail cache (default: data dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_dir: Option<String>,

    #[serde(default = "default_detail_max_entries")]
    pub detail_max_entries: usize,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Vector-service endpoint for the "remote" backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_key_env: Option<String>,
}

fn default_cache_backend() -> String {
    "memory".into()
}

fn default_similarity_threshold() -> f64 {
    0.80
}

fn default_detail_ttl_secs() -> u64 {
    3600
}

fn default_list_max_entries() -> usize {
    512
}

fn default_detail_max_entries() -> usize {
    2048
}

fn default_sweep_interval_secs() -> u64 {
    300
}

const LIST_TTL_MEMORY_SECS: u64 = 3600;
const LIST_TTL_REMOTE_SECS: u64 = 604_800;

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            similarity_threshold: default_similarity_threshold(),
            list_ttl_secs: None,
            detail_ttl_secs: default_detail_ttl_secs(),
            max_entries: default_list_max_entries(),
            detail_dir: None,
            detail_max_entries: default_detail_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            remote_url: None,
            remote_key: None,
            remote_key_env: None,
        }
    }
}

impl CacheConfig {
    /// Effective list TTL for the configured backend.
    pub fn list_ttl(&self) -> Duration {
        let secs = self.list_ttl_secs.unwrap_or(match self.backend.as_str() {
            "remote" => LIST_TTL_REMOTE_SECS,
            _ => LIST_TTL_MEMORY_SECS,
        });
        Duration::from_secs(secs)
    }

    pub fn detail_ttl(&self) -> Duration {
        Duration::from_secs(self.detail_ttl_secs)
    }

    pub fn resolve_remote_key(&self) -> Option<String> {
        resolve_secret_field(&self.remote_key, &self.remote_key_env)
    }
}

// --- Session ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// History window kept for LLM context, in turns.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Conversation budget, in user turns.
    #[serde(default = "default_chat_limit")]
    pub chat_limit: u32,
}

fn default_history_window() -> usize {
    30
}

fn default_chat_limit() -> u32 {
    40
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            chat_limit: default_chat_limit(),
        }
    }
}

// --- Rate limits ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Per-principal sustained request rate, per minute.
    #[serde(default = "default_per_principal_per_min")]
    pub per_principal_per_min: u32,

    /// Per-principal burst allowance.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Global cap on concurrent LLM invocations. The scrape bound is the
    /// engine's own slot semaphore (`search.concurrency`).
    #[serde(default = "default_llm_concurrency")]
    pub llm_concurrency: usize,

    /// Longest a request may queue for global concurrency, in seconds.
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
}

fn default_per_principal_per_min() -> u32 {
    100
}

fn default_burst() -> u32 {
    50
}

fn default_llm_concurrency() -> usize {
    8
}

fn default_queue_timeout_secs() -> u64 {
    30
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            per_principal_per_min: default_per_principal_per_min(),
            burst: default_burst(),
            llm_concurrency: default_llm_concurrency(),
            queue_timeout_secs: default_queue_timeout_secs(),
        }
    }
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "cartwheel_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::CartwheelError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::CartwheelError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    pub fn bind_addr(&self) -> String {
        let host = self
            .gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".into());
        format!("{host}:{}", self.gateway_port())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(
            self.gateway
                .as_ref()
                .map(|g| g.idle_timeout_secs)
                .unwrap_or_else(default_idle_timeout_secs),
        )
    }

    pub fn word_delay(&self) -> Duration {
        Duration::from_millis(
            self.gateway
                .as_ref()
                .map(|g| g.word_delay_ms)
                .unwrap_or_else(default_word_delay_ms),
        )
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(
            self.gateway
                .as_ref()
                .map(|g| g.auth_timeout_secs)
                .unwrap_or_else(default_auth_timeout_secs),
        )
    }

    pub fn history_window(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.history_window)
            .unwrap_or_else(default_history_window)
    }

    pub fn chat_limit(&self) -> u32 {
        self.session
            .as_ref()
            .map(|s| s.chat_limit)
            .unwrap_or_else(default_chat_limit)
    }

    pub fn search_config(&self) -> SearchConfig {
        self.search.clone().unwrap_or_default()
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache.clone().unwrap_or_default()
    }

    pub fn limits_config(&self) -> LimitsConfig {
        self.limits.clone().unwrap_or_default()
    }

    /// Find a provider config by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.iter().find(|pc| pc.id == id))
    }

    /// Get the first (default) provider config.
    pub fn first_provider(&self) -> Option<&ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.as_ref())
            .and_then(|p| p.first())
    }

    /// Get a config value by dotted path (e.g. "gateway.port").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> anyhow::Result<()> {
        let mut json = serde_json::to_value(&*self)
            .map_err(|e| anyhow::anyhow!("Config serialization error: {e}"))?;

        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() {
            return Err(anyhow::anyhow!("Empty path"));
        }

        // Navigate to the parent of the target key
        let mut current = &mut json;
        for segment in &segments[..segments.len() - 1] {
            if current.get(segment).is_none() {
                current[segment] = serde_json::json!({});
            }
            current = current.get_mut(segment).unwrap();
        }

        let last = segments.last().unwrap();
        current[last] = value;

        *self = serde_json::from_value(json)
            .map_err(|e| anyhow::anyhow!("Config deserialization error: {e}"))?;
        Ok(())
    }

    /// Validate config, returning (warnings, errors). Errors mean the
    /// process must not start (exit code 1).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(providers) = self.models.as_ref().and_then(|m| m.providers.as_ref()) {
            for p in providers {
                if p.resolve_api_key().is_none() {
                    warnings.push(format!("Provider '{}' has no API key configured", p.id));
                }
            }
            if providers.is_empty() {
                warnings.push("models.providers is empty; agent turns will fail".into());
            }
        } else {
            warnings.push("No LLM provider configured; agent turns will fail".into());
        }

        if let Some(tls) = self.gateway.as_ref().and_then(|g| g.tls.as_ref()) {
            if !Path::new(&tls.cert_path).exists() {
                errors.push(format!("TLS certificate file not found: {}", tls.cert_path));
            }
            if !Path::new(&tls.key_path).exists() {
                errors.push(format!("TLS key file not found: {}", tls.key_path));
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        if let Some(cache) = &self.cache {
            match cache.backend.as_str() {
                "memory" => {}
                "remote" => {
                    if cache.remote_url.is_none() {
                        errors.push("cache.backend = \"remote\" requires cache.remote_url".into());
                    }
                }
                other => errors.push(format!("Unknown cache backend '{other}'")),
            }
            if !(0.0..=1.0).contains(&cache.similarity_threshold) {
                errors.push(format!(
                    "cache.similarity_threshold must be within [0, 1], got {}",
                    cache.similarity_threshold
                ));
            }
        }

        if let Some(search) = &self.search {
            for site in &search.sites {
                match site.kind.as_str() {
                    "api" | "graphql" => {
                        if site.search_url.is_none() {
                            errors.push(format!("Site '{}' of kind {} needs search_url", site.name, site.kind));
                        }
                    }
                    "scraping" => {
                        if site.schema_file.is_none() {
                            errors.push(format!("Scraping site '{}' needs schema_file", site.name));
                        }
                    }
                    "llm_extraction" => {}
                    other => errors.push(format!("Site '{}' has unknown kind '{other}'", site.name)),
                }
            }
            if search.concurrency == 0 {
                errors.push("search.concurrency cannot be 0".into());
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Cartwheel data: `~/.cartwheel/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cartwheel")
}

/// Expand a configured path, honoring `~`.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}
