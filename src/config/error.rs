// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

/// All errors that can occur during config loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config source: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("upstream URL forbidden: {0}")]
    ForbiddenUpstream(String),
}
