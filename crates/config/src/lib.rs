//! Configuration loading and resolution for RouteCodex.
//!
//! Loads `~/.routecodex/config.json` (or an explicit path), enforces the
//! strict v2 schema, materializes the active routing-policy group, merges
//! per-provider files from `~/.routecodex/provider/<id>/config.v2.json`,
//! expands env placeholders, and produces a fully validated
//! [`ResolvedConfig`]. Config is never partially applied: any failure leaves
//! the caller with its previous configuration.

pub mod expand;
pub mod raw;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use routecodex_core::profile::{AuthMode, CredentialSpec, ModelSpec, ProviderKind, ProviderProfile};
use routecodex_core::target::{RouteCategory, RouteTarget};

use raw::{RawPool, RawProvider, RawProviderFile, RawRoot};

/// Default upstream call deadline.
pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 500_000;
/// Default inter-chunk silence cap for SSE streams (15 min).
pub const DEFAULT_STREAM_IDLE_CAP_MS: u64 = 900_000;
/// Default pre-first-byte cap for SSE streams.
pub const DEFAULT_STREAM_HEADERS_CAP_MS: u64 = 60_000;

/// Configuration errors. All fatal: the load either fully succeeds or the
/// old config stays in effect.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("unknown field '{field}' in {section} (virtualrouterMode=v2 is strict)")]
    UnknownField { section: String, field: String },

    #[error("configuration invalid: {0}")]
    Invalid(String),

    #[error("route target '{target}' references missing {what}")]
    UnresolvableTarget { target: String, what: String },
}

/// HTTP front-door settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    /// When non-empty, requests must present one of these via `X-API-Key`
    /// or `Authorization: Bearer`.
    pub api_keys: Vec<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5555,
            api_keys: Vec::new(),
        }
    }
}

/// Pool selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolMode {
    Priority,
    RoundRobin,
    Weighted,
}

impl PoolMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "priority" => Some(Self::Priority),
            "round-robin" | "roundrobin" => Some(Self::RoundRobin),
            "weighted" => Some(Self::Weighted),
            _ => None,
        }
    }
}

/// An ordered group of route targets sharing a selection mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePool {
    pub id: String,
    pub mode: PoolMode,
    pub targets: Vec<RouteTarget>,
    /// Per-target weights for `weighted` mode; defaults to 1 each.
    pub weights: Vec<u32>,
}

/// category → ordered pools.
pub type RoutingTable = BTreeMap<RouteCategory, Vec<RoutePool>>;

/// Classifier thresholds and category triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    pub long_context_threshold: u32,
    /// Minimum number of attached tools for the `tools` category.
    pub tool_threshold: usize,
    /// Exact model ids that classify as `background`.
    pub background_models: Vec<String>,
    /// Tool names whose presence classifies as `coding`.
    pub coding_tools: Vec<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            long_context_threshold: 32_000,
            tool_threshold: 1,
            background_models: Vec::new(),
            coding_tools: Vec::new(),
        }
    }
}

/// Health/admission policy knobs, as configured. The health crate maps these
/// onto its runtime policy (applying `ROUTECODEX_RL_SCHEDULE` last).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    pub fatal_status_codes: Vec<u16>,
    pub consecutive_error_threshold: u32,
    pub fatal_ms: u64,
    pub default_ms: u64,
    pub rate_limit_schedule_ms: Vec<u64>,
    pub reset_window_ms: u64,
    pub blacklist_window_ms: u64,
    pub blacklist_threshold: u32,
    pub blacklist_duration_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            fatal_status_codes: vec![403],
            consecutive_error_threshold: 3,
            fatal_ms: 120_000,
            default_ms: 30_000,
            rate_limit_schedule_ms: vec![300_000, 3_600_000, 21_600_000, 86_400_000],
            reset_window_ms: 86_400_000,
            blacklist_window_ms: 60_000,
            blacklist_threshold: 3,
            blacklist_duration_ms: 1_800_000,
        }
    }
}

/// Load-balancing defaults applied to pools that omit a mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancingSettings {
    pub default_mode: Option<PoolMode>,
}

/// Per-pipeline limits, merged from provider limits and model specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineLimits {
    pub max_context: u32,
    pub max_tokens: u32,
    pub provider_timeout_ms: u64,
    pub stream_idle_cap_ms: u64,
    pub stream_headers_cap_ms: u64,
}

/// The materialized description of how one target processes one request.
/// Stage fields are registry identifiers resolved by the pipeline factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub target: RouteTarget,
    pub llm_switch: String,
    pub workflow: String,
    pub compatibility: String,
    pub limits: PipelineLimits,
}

/// The fully resolved, validated configuration tree.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub source_path: PathBuf,
    pub http: HttpServerConfig,
    pub active_group: String,
    pub routing: RoutingTable,
    pub providers: BTreeMap<String, ProviderProfile>,
    /// One spec per unique route target.
    pub pipelines: Vec<PipelineSpec>,
    pub health: HealthSettings,
    pub classifier: ClassifierSettings,
    pub load_balancing: LoadBalancingSettings,
    pub web_search: Option<Value>,
    pub exec_command_guard: Option<Value>,
    pub clock: Option<Value>,
}

impl ResolvedConfig {
    pub fn pipeline_spec(&self, target: &RouteTarget) -> Option<&PipelineSpec> {
        self.pipelines.iter().find(|p| &p.target == target)
    }
}

/// The RouteCodex state directory (`~/.routecodex`).
pub fn routecodex_home() -> PathBuf {
    dirs_home().join(".routecodex")
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Resolve the config path by precedence: explicit argument →
/// `ROUTECODEX_CONFIG_PATH` → `ROUTECODEX_CONFIG` → `./routecodex.json` →
/// `<home>/.routecodex/config.json`.
pub fn resolve_config_path(explicit: Option<&Path>, home: &Path) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    for var in ["ROUTECODEX_CONFIG_PATH", "ROUTECODEX_CONFIG"] {
        if let Ok(p) = std::env::var(var) {
            if !p.is_empty() {
                return PathBuf::from(p);
            }
        }
    }
    let local = PathBuf::from("routecodex.json");
    if local.exists() {
        return local;
    }
    home.join("config.json")
}

/// The config loader. Keeps warn-dedup state across reloads so each config
/// path logs its legacy-key warning once.
pub struct Loader {
    home: PathBuf,
    legacy_warned: Mutex<HashSet<PathBuf>>,
}

impl Loader {
    pub fn new() -> Self {
        Self::with_home(routecodex_home())
    }

    /// Override the state directory (tests point this at a tempdir).
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            legacy_warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Load and resolve configuration.
    pub fn load(&self, explicit: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
        let path = resolve_config_path(explicit, &self.home);
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        self.load_from_str(&content, &path)
    }

    fn load_from_str(&self, content: &str, path: &Path) -> Result<ResolvedConfig, ConfigError> {
        let mut root: Value = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let Some(root_map) = root.as_object_mut() else {
            return Err(ConfigError::Invalid("config root must be a JSON object".into()));
        };

        let is_v2 = root_map
            .get("virtualrouterMode")
            .and_then(Value::as_str)
            .map(|m| m == "v2")
            .unwrap_or(false);

        if is_v2 {
            let warn = self
                .legacy_warned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(path.to_path_buf());
            raw::enforce_v2_schema(root_map, &path.display().to_string(), warn)?;
        }

        let parsed: RawRoot = serde_json::from_value(root).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        self.resolve(parsed, path, is_v2)
    }

    fn resolve(
        &self,
        parsed: RawRoot,
        path: &Path,
        is_v2: bool,
    ) -> Result<ResolvedConfig, ConfigError> {
        let mut warned = HashSet::new();

        // -- httpserver --------------------------------------------------
        let mut http = HttpServerConfig::default();
        if let Some(host) = parsed.httpserver.host {
            http.host = expand::expand_env(&host, &mut warned);
        }
        if let Some(port) = parsed.httpserver.port {
            http.port = port;
        }
        http.api_keys = parsed
            .httpserver
            .apikeys
            .iter()
            .map(|k| expand::expand_env(k, &mut warned))
            .filter(|k| !k.is_empty())
            .collect();
        for var in ["ROUTECODEX_PORT", "RCC_PORT"] {
            if let Ok(v) = std::env::var(var) {
                if let Ok(p) = v.parse() {
                    http.port = p;
                    break;
                }
            }
        }
        if http.port == 0 {
            return Err(ConfigError::Invalid("httpserver.port must be non-zero".into()));
        }

        // -- active routing-policy group ---------------------------------
        let vr = parsed.virtualrouter;
        let (active_group, raw_routing, group) = if is_v2 || !vr.routing_policy_groups.is_empty() {
            if vr.routing_policy_groups.is_empty() {
                return Err(ConfigError::Invalid(
                    "virtualrouter.routingPolicyGroups is required under virtualrouterMode=v2"
                        .into(),
                ));
            }
            let name = vr
                .active_routing_policy_group
                .clone()
                .filter(|g| vr.routing_policy_groups.contains_key(g))
                .or_else(|| {
                    vr.routing_policy_groups
                        .contains_key("default")
                        .then(|| "default".to_string())
                })
                .or_else(|| vr.routing_policy_groups.keys().next().cloned())
                .expect("non-empty group map always yields a name");
            if let Some(requested) = &vr.active_routing_policy_group {
                if requested != &name {
                    return Err(ConfigError::Invalid(format!(
                        "activeRoutingPolicyGroup '{requested}' not found"
                    )));
                }
            }
            let group = vr.routing_policy_groups.get(&name).cloned().unwrap_or_default();
            (name, group.routing.clone(), group)
        } else {
            // Legacy single-file config: routing inline under virtualrouter.
            ("default".to_string(), vr.routing.clone(), Default::default())
        };

        // -- policy keys copied from the active group --------------------
        let classifier = {
            let mut c = ClassifierSettings::default();
            if let Some(raw) = &group.classifier {
                if let Some(v) = raw.long_context_threshold {
                    c.long_context_threshold = v;
                }
                if let Some(v) = raw.tool_threshold {
                    c.tool_threshold = v;
                }
                c.background_models = raw.background_models.clone();
                c.coding_tools = raw.coding_tools.clone();
            }
            if let Some(cr) = &group.context_routing {
                if let Some(v) = cr.long_context_threshold {
                    c.long_context_threshold = v;
                }
            }
            c
        };

        let health = {
            let mut h = HealthSettings::default();
            if let Some(raw) = &group.health {
                if let Some(v) = &raw.fatal_status_codes {
                    h.fatal_status_codes = v.clone();
                }
                if let Some(v) = raw.consecutive_error_threshold {
                    h.consecutive_error_threshold = v;
                }
                if let Some(v) = raw.fatal_ms {
                    h.fatal_ms = v;
                }
                if let Some(v) = raw.default_ms {
                    h.default_ms = v;
                }
                if let Some(v) = &raw.rate_limit_schedule_ms {
                    if v.is_empty() {
                        return Err(ConfigError::Invalid(
                            "health.rateLimitScheduleMs must not be empty".into(),
                        ));
                    }
                    h.rate_limit_schedule_ms = v.clone();
                }
                if let Some(v) = raw.reset_window_ms {
                    h.reset_window_ms = v;
                }
                if let Some(v) = raw.blacklist_window_ms {
                    h.blacklist_window_ms = v;
                }
                if let Some(v) = raw.blacklist_threshold {
                    h.blacklist_threshold = v;
                }
                if let Some(v) = raw.blacklist_duration_ms {
                    h.blacklist_duration_ms = v;
                }
            }
            h
        };

        let load_balancing = LoadBalancingSettings {
            default_mode: group
                .load_balancing
                .as_ref()
                .and_then(|lb| lb.default_mode.as_deref())
                .map(|m| {
                    PoolMode::parse(m).ok_or_else(|| {
                        ConfigError::Invalid(format!("unknown loadBalancing.defaultMode '{m}'"))
                    })
                })
                .transpose()?,
        };

        // -- providers ----------------------------------------------------
        let mut providers = BTreeMap::new();
        let mut model_overrides: BTreeMap<(String, String), StageOverride> = BTreeMap::new();
        let mut provider_limits: BTreeMap<String, raw::RawLimits> = BTreeMap::new();

        let declared: Vec<(String, RawProvider)> = if is_v2 {
            self.load_provider_dir()?
        } else {
            vr.providers.into_iter().collect()
        };

        for (id, raw_provider) in declared {
            let (profile, overrides) =
                build_profile(&id, &raw_provider, &self.home, &mut warned)?;
            for (model, ov) in overrides {
                model_overrides.insert((id.clone(), model), ov);
            }
            if let Some(limits) = raw_provider.limits {
                provider_limits.insert(id.clone(), limits);
            }
            providers.insert(id, profile);
        }

        // -- routing table ------------------------------------------------
        let routing = build_routing_table(&raw_routing, &providers, &load_balancing)?;
        let default_pools = routing.get(&RouteCategory::Default);
        if default_pools.map_or(true, |pools| pools.iter().all(|p| p.targets.is_empty())) {
            return Err(ConfigError::Invalid(
                "routing.default must contain at least one target".into(),
            ));
        }

        // -- pipeline specs ----------------------------------------------
        let mut pipelines = Vec::new();
        let mut seen = HashSet::new();
        for pools in routing.values() {
            for pool in pools {
                for target in &pool.targets {
                    if !seen.insert(target.key()) {
                        continue;
                    }
                    let profile = providers
                        .get(&target.provider)
                        .expect("validated by build_routing_table");
                    let ov = model_overrides.get(&(target.provider.clone(), target.model.clone()));
                    let limits = provider_limits.get(&target.provider);
                    pipelines.push(build_pipeline_spec(target, profile, ov, limits));
                }
            }
        }

        Ok(ResolvedConfig {
            source_path: path.to_path_buf(),
            http,
            active_group,
            routing,
            providers,
            pipelines,
            health,
            classifier,
            load_balancing,
            web_search: group.web_search,
            exec_command_guard: group.exec_command_guard,
            clock: group.clock,
        })
    }

    /// Load every `provider/<id>/config.v2.json` under the state dir.
    fn load_provider_dir(&self) -> Result<Vec<(String, RawProvider)>, ConfigError> {
        let dir = self.home.join("provider");
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: dir,
                    reason: e.to_string(),
                });
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| ConfigError::Read {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let file = entry.path().join("config.v2.json");
            if !file.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&file).map_err(|e| ConfigError::Read {
                path: file.clone(),
                reason: e.to_string(),
            })?;
            let parsed: RawProviderFile =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                    path: file.clone(),
                    reason: e.to_string(),
                })?;
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if parsed.provider_id != dir_name {
                return Err(ConfigError::Invalid(format!(
                    "provider file {} declares providerId '{}' but lives under '{}'",
                    file.display(),
                    parsed.provider_id,
                    dir_name
                )));
            }
            out.push((parsed.provider_id, parsed.provider));
        }

        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-model stage override, merged over the provider-level choice.
#[derive(Debug, Clone, Default)]
struct StageOverride {
    llm_switch: Option<String>,
    workflow: Option<String>,
    compatibility: Option<String>,
    max_context: Option<u32>,
    max_tokens: Option<u32>,
}

fn build_profile(
    id: &str,
    raw: &RawProvider,
    home: &Path,
    warned: &mut HashSet<String>,
) -> Result<(ProviderProfile, Vec<(String, StageOverride)>), ConfigError> {
    let kind: ProviderKind = serde_json::from_value(Value::String(raw.kind.clone()))
        .map_err(|_| ConfigError::Invalid(format!("provider '{id}': unknown type '{}'", raw.kind)))?;

    let auth_mode = match raw.auth_mode.as_deref() {
        None => default_auth_mode(kind),
        Some("apiKey") | Some("apikey") => AuthMode::ApiKey,
        Some("bearer") => AuthMode::Bearer,
        Some("oauth") => AuthMode::OAuth,
        Some("none") => AuthMode::None,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "provider '{id}': unknown authMode '{other}'"
            )));
        }
    };

    let base_url = raw
        .base_url
        .as_deref()
        .map(|u| expand::expand_env(u, warned))
        .or_else(|| {
            // LM Studio instances commonly advertise themselves via env.
            (kind == ProviderKind::LmStudioHttp)
                .then(|| std::env::var("LM_STUDIO_BASE_URL").ok())
                .flatten()
        })
        .unwrap_or_else(|| default_base_url(kind).to_string());

    // Expand key1..keyN aliases from the declared apiKey order.
    let mut credentials = BTreeMap::new();
    for (i, entry) in raw.api_key.iter().enumerate() {
        let alias = format!("key{}", i + 1);
        credentials.insert(alias, parse_credential_entry(entry, warned));
    }
    // OAuth providers without explicit entries fall back to the daemon's
    // default token-file location.
    if credentials.is_empty() && auth_mode == AuthMode::OAuth {
        let token_file = home.join("auth").join(format!("{id}-oauth.json"));
        credentials.insert(
            "key1".into(),
            CredentialSpec::OAuth {
                token_file: token_file.to_string_lossy().into_owned(),
            },
        );
    }
    // Well-known env fallbacks for providers declared without keys.
    if credentials.is_empty() {
        let fallback_var = match kind {
            ProviderKind::OpenAiHttp => Some("OPENAI_API_KEY"),
            ProviderKind::AnthropicHttp => Some("ANTHROPIC_API_KEY"),
            _ => None,
        };
        if let Some(var) = fallback_var {
            credentials.insert("key1".into(), CredentialSpec::Env { var: var.into() });
        }
    }
    if credentials.is_empty() && auth_mode != AuthMode::None {
        return Err(ConfigError::Invalid(format!(
            "provider '{id}' declares authMode {auth_mode:?} but no credentials"
        )));
    }

    let mut models = BTreeMap::new();
    let mut overrides = Vec::new();
    for (model_id, raw_model) in &raw.models {
        let mut spec = ModelSpec::default();
        if let Some(v) = raw_model.max_context {
            spec.max_context = v;
        }
        if let Some(v) = raw_model.max_tokens {
            spec.max_tokens = v;
        }
        spec.capabilities = raw_model.capabilities.clone();
        models.insert(model_id.clone(), spec);

        if raw_model.llm_switch.is_some()
            || raw_model.workflow.is_some()
            || raw_model.compatibility.is_some()
        {
            overrides.push((
                model_id.clone(),
                StageOverride {
                    llm_switch: raw_model.llm_switch.clone(),
                    workflow: raw_model.workflow.clone(),
                    compatibility: raw_model.compatibility.clone(),
                    max_context: raw_model.max_context,
                    max_tokens: raw_model.max_tokens,
                },
            ));
        }
    }

    let profile = ProviderProfile {
        id: id.to_string(),
        kind,
        base_url,
        auth_mode,
        user_agent_override: raw
            .user_agent
            .as_deref()
            .map(|u| expand::expand_env(u, warned)),
        credentials,
        models,
        llm_switch: raw.llm_switch.clone(),
        workflow: raw.workflow.clone(),
        compatibility: raw.compatibility.clone(),
    };

    Ok((profile, overrides))
}

fn default_auth_mode(kind: ProviderKind) -> AuthMode {
    match kind {
        ProviderKind::QwenProvider => AuthMode::OAuth,
        ProviderKind::LmStudioHttp => AuthMode::None,
        _ => AuthMode::ApiKey,
    }
}

fn default_base_url(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAiHttp => "https://api.openai.com/v1",
        ProviderKind::AnthropicHttp => "https://api.anthropic.com",
        ProviderKind::LmStudioHttp => "http://127.0.0.1:1234/v1",
        ProviderKind::QwenProvider => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        ProviderKind::GenericHttp => "http://127.0.0.1:8000/v1",
    }
}

/// Parse one `apiKey` entry into a credential source.
///
/// `env:NAME` and pure `${NAME}` / `$NAME` placeholders become env-backed
/// (re-read on resolve so rotation is picked up); `authfile:PATH` reads a
/// plain key file; `oauth:PATH` delegates to the token daemon; anything else
/// is inline material with placeholders expanded eagerly.
fn parse_credential_entry(entry: &str, warned: &mut HashSet<String>) -> CredentialSpec {
    if let Some(var) = entry.strip_prefix("env:") {
        return CredentialSpec::Env { var: var.to_string() };
    }
    if let Some(path) = entry.strip_prefix("authfile:") {
        return CredentialSpec::File {
            path: expand::expand_env(path, warned),
        };
    }
    if let Some(path) = entry.strip_prefix("oauth:") {
        return CredentialSpec::OAuth {
            token_file: expand::expand_env(path, warned),
        };
    }
    if let Some(var) = expand::pure_placeholder(entry) {
        return CredentialSpec::Env { var: var.to_string() };
    }
    CredentialSpec::Inline {
        value: expand::expand_env(entry, warned),
    }
}

fn build_routing_table(
    raw_routing: &BTreeMap<String, Vec<RawPool>>,
    providers: &BTreeMap<String, ProviderProfile>,
    lb: &LoadBalancingSettings,
) -> Result<RoutingTable, ConfigError> {
    let mut routing = RoutingTable::new();

    for (category_name, raw_pools) in raw_routing {
        let Some(category) = RouteCategory::parse(category_name) else {
            return Err(ConfigError::Invalid(format!(
                "unknown routing category '{category_name}'"
            )));
        };

        let mut pools = Vec::new();
        for raw_pool in raw_pools {
            let mode = match PoolMode::parse(&raw_pool.mode) {
                Some(m) => m,
                None => lb.default_mode.ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "pool '{}': unknown mode '{}'",
                        raw_pool.id, raw_pool.mode
                    ))
                })?,
            };

            let mut targets = Vec::new();
            for target_str in &raw_pool.targets {
                let target = resolve_target(target_str, providers)?;
                targets.push(target);
            }

            if !raw_pool.weights.is_empty() && raw_pool.weights.len() != targets.len() {
                return Err(ConfigError::Invalid(format!(
                    "pool '{}': {} weights for {} targets",
                    raw_pool.id,
                    raw_pool.weights.len(),
                    targets.len()
                )));
            }

            pools.push(RoutePool {
                id: raw_pool.id.clone(),
                mode,
                weights: if raw_pool.weights.is_empty() {
                    vec![1; targets.len()]
                } else {
                    raw_pool.weights.clone()
                },
                targets,
            });
        }

        routing.insert(category, pools);
    }

    Ok(routing)
}

/// Parse a target string and check it against the provider set. Every
/// `RouteTarget` that survives the load references an existing provider,
/// model, and credential alias.
fn resolve_target(
    s: &str,
    providers: &BTreeMap<String, ProviderProfile>,
) -> Result<RouteTarget, ConfigError> {
    // Provider lookup first so the default alias comes from the profile.
    let provider_id = s.split('.').next().unwrap_or_default();
    let profile = providers
        .get(provider_id)
        .ok_or_else(|| ConfigError::UnresolvableTarget {
            target: s.to_string(),
            what: format!("provider '{provider_id}'"),
        })?;

    let default_alias = profile.first_alias().unwrap_or("key1");
    let target =
        RouteTarget::parse(s, default_alias).ok_or_else(|| ConfigError::UnresolvableTarget {
            target: s.to_string(),
            what: "a parseable provider.model form".to_string(),
        })?;

    if !profile.has_model(&target.model) {
        return Err(ConfigError::UnresolvableTarget {
            target: s.to_string(),
            what: format!("model '{}'", target.model),
        });
    }
    if profile.auth_mode != AuthMode::None && !profile.has_credential(&target.key_alias) {
        return Err(ConfigError::UnresolvableTarget {
            target: s.to_string(),
            what: format!("credential alias '{}'", target.key_alias),
        });
    }

    Ok(target)
}

fn build_pipeline_spec(
    target: &RouteTarget,
    profile: &ProviderProfile,
    ov: Option<&StageOverride>,
    limits: Option<&raw::RawLimits>,
) -> PipelineSpec {
    let model_spec = profile.models.get(&target.model).cloned().unwrap_or_default();

    let pick = |model_level: Option<&String>, provider_level: Option<&String>, default: &str| {
        model_level
            .or(provider_level)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    // Anthropic-native upstreams default to the protocol bridge; everything
    // else speaks the canonical protocol already.
    let default_switch = match profile.kind {
        ProviderKind::AnthropicHttp => "anthropic-openai",
        _ => "openai-passthrough",
    };

    PipelineSpec {
        target: target.clone(),
        llm_switch: pick(
            ov.and_then(|o| o.llm_switch.as_ref()),
            profile.llm_switch.as_ref(),
            default_switch,
        ),
        workflow: pick(
            ov.and_then(|o| o.workflow.as_ref()),
            profile.workflow.as_ref(),
            "streaming-control",
        ),
        compatibility: pick(
            ov.and_then(|o| o.compatibility.as_ref()),
            profile.compatibility.as_ref(),
            profile.kind.default_compatibility(),
        ),
        limits: PipelineLimits {
            max_context: ov.and_then(|o| o.max_context).unwrap_or(model_spec.max_context),
            max_tokens: ov.and_then(|o| o.max_tokens).unwrap_or(model_spec.max_tokens),
            provider_timeout_ms: limits
                .and_then(|l| l.provider_timeout_ms)
                .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MS),
            stream_idle_cap_ms: limits
                .and_then(|l| l.stream_idle_cap_ms)
                .unwrap_or(DEFAULT_STREAM_IDLE_CAP_MS),
            stream_headers_cap_ms: limits
                .and_then(|l| l.stream_headers_cap_ms)
                .unwrap_or(DEFAULT_STREAM_HEADERS_CAP_MS),
        },
    }
}
