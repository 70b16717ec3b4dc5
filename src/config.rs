/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config.rs
*
* This file defines the operator's runtime configuration. All tunables are
* read once from environment variables at startup, so a misconfigured
* deployment fails fast with a clear error instead of misbehaving later.
*
* Architecture:
* - `OperatorConfig::from_env` resolves every variable against the process
*   environment. The lookup is injected as a closure so the parsing logic is
*   testable without mutating the test process's environment.
* - The long-lived job-source credential is wrapped in `SecretString`, which
*   redacts itself from Debug output so it can never leak through logging.
* - Defaults follow the controller's operational contract: 30s API timeouts,
*   a degraded-health threshold of 3 consecutive poll failures, and an
*   exponential error backoff capped at 5 minutes.
*
* SPDX-License-Identifier: Apache-2.0
*/

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    MissingVar(&'static str),

    #[error("environment variable '{0}' has invalid value '{1}'")]
    InvalidVar(&'static str, String),
}

/// A secret value that never appears in Debug or Display output.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Expose the inner value. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// Operator-wide settings resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Base URL of the external job source API, e.g. "https://forge.example.com/api/v3".
    pub job_source_endpoint: String,

    /// Long-lived credential exchanged for short-lived registration tokens.
    pub credential: SecretString,

    /// Default interval between queue-depth observations per runner group.
    pub poll_interval: Duration,

    /// Consecutive poll failures before a group is reported degraded.
    pub degraded_threshold: u32,

    /// Per-call timeout for job source and token exchange requests.
    pub request_timeout: Duration,

    /// First delay of the exponential error backoff.
    pub backoff_base: Duration,

    /// Ceiling for the exponential error backoff.
    pub backoff_cap: Duration,

    /// Interval of the orphaned-pod reaper, independent of reconciliation.
    pub reap_interval: Duration,

    /// Port the /metrics endpoint listens on.
    pub metrics_port: u16,
}

impl OperatorConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let job_source_endpoint = lookup("JOB_SOURCE_ENDPOINT")
            .ok_or(ConfigError::MissingVar("JOB_SOURCE_ENDPOINT"))?
            .trim_end_matches('/')
            .to_string();

        let credential = lookup("JOB_SOURCE_CREDENTIAL")
            .filter(|v| !v.is_empty())
            .map(SecretString::new)
            .ok_or(ConfigError::MissingVar("JOB_SOURCE_CREDENTIAL"))?;

        Ok(Self {
            job_source_endpoint,
            credential,
            poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "QUEUE_POLL_INTERVAL_SECONDS",
                30,
            )?),
            degraded_threshold: parse_or(&lookup, "QUEUE_DEGRADED_THRESHOLD", 3)? as u32,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "API_REQUEST_TIMEOUT_SECONDS",
                30,
            )?),
            backoff_base: Duration::from_secs(parse_or(&lookup, "ERROR_BACKOFF_BASE_SECONDS", 5)?),
            backoff_cap: Duration::from_secs(parse_or(&lookup, "ERROR_BACKOFF_CAP_SECONDS", 300)?),
            reap_interval: Duration::from_secs(parse_or(
                &lookup,
                "ORPHAN_REAP_INTERVAL_SECONDS",
                60,
            )?),
            metrics_port: parse_or(&lookup, "METRICS_PORT", 9090)? as u16,
        })
    }
}

fn parse_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidVar(name, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn config_from(pairs: &[(&str, &str)]) -> Result<OperatorConfig, ConfigError> {
        let vars = env(pairs);
        OperatorConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = config_from(&[
            ("JOB_SOURCE_ENDPOINT", "https://forge.example.com/api/v3/"),
            ("JOB_SOURCE_CREDENTIAL", "pat-abc123"),
        ])
        .unwrap();

        // Trailing slash is normalized away.
        assert_eq!(config.job_source_endpoint, "https://forge.example.com/api/v3");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.degraded_threshold, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.backoff_cap, Duration::from_secs(300));
        assert_eq!(config.reap_interval, Duration::from_secs(60));
        assert_eq!(config.metrics_port, 9090);
    }

    #[test]
    fn test_missing_endpoint_fails() {
        let err = config_from(&[("JOB_SOURCE_CREDENTIAL", "pat")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("JOB_SOURCE_ENDPOINT")));
    }

    #[test]
    fn test_empty_credential_rejected() {
        let err = config_from(&[
            ("JOB_SOURCE_ENDPOINT", "https://forge.example.com"),
            ("JOB_SOURCE_CREDENTIAL", ""),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("JOB_SOURCE_CREDENTIAL")));
    }

    #[test]
    fn test_invalid_numeric_value_rejected() {
        let err = config_from(&[
            ("JOB_SOURCE_ENDPOINT", "https://forge.example.com"),
            ("JOB_SOURCE_CREDENTIAL", "pat"),
            ("QUEUE_POLL_INTERVAL_SECONDS", "soon"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidVar("QUEUE_POLL_INTERVAL_SECONDS", _)
        ));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let secret = SecretString::new("pat-super-secret".to_string());
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("super-secret"));
        assert_eq!(rendered, "SecretString(***)");
    }
}
