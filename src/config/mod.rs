// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Config loader and validator
//
// Loads config.yaml, validates structure and version, applies environment
// overrides, and runs SSRF validation on every upstream URL.

mod error;
mod loader;
pub(crate) mod raw;
mod source;
mod ssrf;
mod types;

pub use error::ConfigError;
pub use loader::{default_config, load_config, resolve_config_path};
pub use source::{ConfigSource, FileSource, StringSource};
pub use ssrf::validate_upstream_url;
pub use types::{
    default_entity_set, AuditConfig, Config, ProxyConfig, ScannerConfig, ScannerMode,
    UpstreamConfig, SUPPORTED_CONFIG_VERSION,
};

/// State directory: $ONGARDE_HOME if set (tests), else ~/.ongarde.
pub fn state_dir() -> std::path::PathBuf {
    if let Ok(home) = std::env::var("ONGARDE_HOME") {
        return home.into();
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    std::path::PathBuf::from(home).join(".ongarde")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_YAML: &str = r#"version: 1

upstream:
  openai: https://api.openai.com
  anthropic: https://api.anthropic.com

proxy:
  host: 127.0.0.1
  port: 4242

scanner:
  mode: full

audit:
  retention_days: 90
  path: ~/.ongarde/audit.db
"#;

    fn make_source(yaml: &str) -> StringSource {
        StringSource {
            content: yaml.to_string(),
        }
    }

    #[test]
    fn valid_config_parses_all_key_fields() {
        let config = load_config(&make_source(EXAMPLE_YAML)).unwrap();

        assert_eq!(config.upstream.openai, "https://api.openai.com");
        assert_eq!(config.upstream.anthropic, "https://api.anthropic.com");
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(config.proxy.port, 4242);
        assert_eq!(config.scanner.mode, ScannerMode::Full);
        assert_eq!(config.audit.retention_days, 90);
        assert!(!config.strict_mode);
    }

    #[test]
    fn minimal_config_is_valid() {
        let config = load_config(&make_source("version: 1\n")).unwrap();
        assert_eq!(config.proxy.port, 4242);
        assert_eq!(config.scanner.mode, ScannerMode::Full);
        assert_eq!(config.scanner.entity_set.len(), 5);
    }

    #[test]
    fn missing_version_rejected() {
        let err = load_config(&make_source("proxy:\n  port: 9000\n")).unwrap_err();
        assert!(err.to_string().contains("version"), "got: {err}");
    }

    #[test]
    fn unsupported_version_rejected() {
        let err = load_config(&make_source("version: 2\n")).unwrap_err();
        assert!(err.to_string().contains('2'), "got: {err}");
    }

    #[test]
    fn invalid_scanner_mode_rejected() {
        let yaml = "version: 1\nscanner:\n  mode: turbo\n";
        let err = load_config(&make_source(yaml)).unwrap_err();
        assert!(err.to_string().contains("turbo"), "got: {err}");
    }

    #[test]
    fn lite_mode_parsed() {
        let yaml = "version: 1\nscanner:\n  mode: lite\n";
        let config = load_config(&make_source(yaml)).unwrap();
        assert_eq!(config.scanner.mode, ScannerMode::Lite);
    }

    #[test]
    fn invalid_yaml_rejected() {
        let err = load_config(&make_source("version: [unterminated")).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn private_upstream_rejected_at_load() {
        let yaml = "version: 1\nupstream:\n  openai: http://169.254.169.254\n";
        let err = load_config(&make_source(yaml)).unwrap_err();
        assert!(matches!(err, ConfigError::ForbiddenUpstream(_)));
    }

    #[test]
    fn localhost_custom_upstream_accepted() {
        let yaml = "version: 1\nupstream:\n  custom: http://localhost:11434\n";
        let config = load_config(&make_source(yaml)).unwrap();
        assert_eq!(
            config.upstream.custom.as_deref(),
            Some("http://localhost:11434")
        );
    }

    #[test]
    fn reloading_same_content_is_idempotent() {
        let a = load_config(&make_source(EXAMPLE_YAML)).unwrap();
        let b = load_config(&make_source(EXAMPLE_YAML)).unwrap();
        assert_eq!(a.proxy.port, b.proxy.port);
        assert_eq!(a.upstream.openai, b.upstream.openai);
        assert_eq!(a.scanner.mode, b.scanner.mode);
    }

    #[test]
    fn strict_mode_parsed_as_stub() {
        let yaml = "version: 1\nstrict_mode: true\n";
        let config = load_config(&make_source(yaml)).unwrap();
        assert!(config.strict_mode);
    }

    #[test]
    fn config_source_string_source_works() {
        let source = StringSource {
            content: "version: 1\n".to_string(),
        };
        assert!(source.load().unwrap().contains("version"));
    }
}
