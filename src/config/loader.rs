use super::error::ConfigError;
use super::raw;
use super::source::ConfigSource;
use super::ssrf::validate_upstream_url;
use super::types::*;

/// Load and validate an OnGarde config from the given source.
///
/// Steps:
/// 1. Read raw YAML from source
/// 2. Parse into raw deserialization types
/// 3. Validate version and scanner.mode
/// 4. Merge onto defaults
/// 5. Apply environment overrides (ONGARDE_PORT, ONGARDE_AUTH_REQUIRED)
/// 6. Validate every upstream URL against SSRF ranges
pub fn load_config(source: &dyn ConfigSource) -> Result<Config, ConfigError> {
    let raw_yaml = source.load()?;
    let raw: raw::RawConfig = serde_yaml::from_str(&raw_yaml)?;
    let config = build_config(raw)?;
    finalize(config)
}

/// Build a default config (no file found — not an error) with env overrides
/// and upstream validation applied.
pub fn default_config() -> Result<Config, ConfigError> {
    finalize(Config::default())
}

fn finalize(mut config: Config) -> Result<Config, ConfigError> {
    apply_env_overrides(&mut config)?;

    validate_upstream_url(&config.upstream.openai)?;
    validate_upstream_url(&config.upstream.anthropic)?;
    if let Some(custom) = &config.upstream.custom {
        validate_upstream_url(custom)?;
    }

    if config.proxy.host == "0.0.0.0" {
        tracing::warn!(
            "proxy.host is 0.0.0.0 — the proxy will be network-accessible; \
             127.0.0.1 is recommended for local-only access"
        );
    }
    if config.strict_mode {
        tracing::warn!("strict_mode is reserved and not implemented — ignored");
    }

    Ok(config)
}

fn build_config(raw: raw::RawConfig) -> Result<Config, ConfigError> {
    // Version is required when a file is present
    let version = raw.version.ok_or_else(|| {
        ConfigError::Validation(
            "missing required \"version\" field — add \"version: 1\"".to_string(),
        )
    })?;
    if version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {version}, expected {SUPPORTED_CONFIG_VERSION}"
        )));
    }

    let defaults = Config::default();

    let upstream = match raw.upstream {
        Some(u) => UpstreamConfig {
            openai: u.openai.unwrap_or(defaults.upstream.openai),
            anthropic: u.anthropic.unwrap_or(defaults.upstream.anthropic),
            custom: u.custom,
            openai_api_key: u.openai_api_key,
            anthropic_api_key: u.anthropic_api_key,
        },
        None => defaults.upstream,
    };

    let proxy = match raw.proxy {
        Some(p) => ProxyConfig {
            host: p.host.unwrap_or(defaults.proxy.host),
            port: p.port.unwrap_or(defaults.proxy.port),
        },
        None => defaults.proxy,
    };

    let scanner = match raw.scanner {
        Some(s) => {
            let mode = match s.mode.as_deref() {
                Some("full") | None => ScannerMode::Full,
                Some("lite") => ScannerMode::Lite,
                Some(other) => {
                    return Err(ConfigError::Validation(format!(
                        "invalid scanner.mode \"{other}\", expected \"full\" or \"lite\""
                    )));
                }
            };
            ScannerConfig {
                mode,
                entity_set: s.entity_set.unwrap_or_else(default_entity_set),
                sync_threshold: s.sync_threshold,
                input_hard_cap: s.input_hard_cap.unwrap_or(defaults.scanner.input_hard_cap),
            }
        }
        None => defaults.scanner,
    };

    let audit = match raw.audit {
        Some(a) => AuditConfig {
            retention_days: a.retention_days.unwrap_or(defaults.audit.retention_days),
            path: a.path.unwrap_or(defaults.audit.path),
        },
        None => defaults.audit,
    };

    Ok(Config {
        upstream,
        proxy,
        scanner,
        audit,
        strict_mode: raw.strict_mode,
        auth_required: true,
    })
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(port) = std::env::var("ONGARDE_PORT") {
        config.proxy.port = port.parse().map_err(|_| {
            ConfigError::Validation(format!("ONGARDE_PORT is not a valid port: \"{port}\""))
        })?;
    }
    if let Ok(required) = std::env::var("ONGARDE_AUTH_REQUIRED") {
        config.auth_required = !required.eq_ignore_ascii_case("false");
    }
    if config.upstream.openai_api_key.is_none() {
        config.upstream.openai_api_key = std::env::var("OPENAI_API_KEY").ok();
    }
    if config.upstream.anthropic_api_key.is_none() {
        config.upstream.anthropic_api_key = std::env::var("ANTHROPIC_API_KEY").ok();
    }
    Ok(())
}

/// Resolve the config file path from the explicit argument, ONGARDE_CONFIG,
/// then the state directory, then the home directory. Returns None when no
/// file exists at any candidate (missing config is not an error).
pub fn resolve_config_path(explicit: Option<&str>) -> Option<std::path::PathBuf> {
    let mut candidates: Vec<std::path::PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.into());
    }
    if let Ok(env_path) = std::env::var("ONGARDE_CONFIG") {
        candidates.push(env_path.into());
    }
    candidates.push(crate::config::state_dir().join("config.yaml"));

    candidates.into_iter().find(|p| p.is_file())
}
