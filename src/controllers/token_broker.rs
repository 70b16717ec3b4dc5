/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/token_broker.rs
*
* This module exchanges the operator's long-lived credential for short-lived,
* single-use registration tokens. Every runner pod receives exactly one such
* token in its environment, uses it once to register with the job source, and
* never sees it again: the token is invalidated on first registration or when
* its TTL expires, whichever comes first.
*
* Architecture:
* - `TokenBroker::mint` performs the POST exchange against the job source's
*   registration-token endpoint, scoped to the runner group's identity.
* - A credential rejection (401/403) is a permanent failure: the reconciler
*   surfaces it as the group's Error state, because no amount of retrying
*   fixes a revoked credential. Rate limiting (429) is transient and only
*   triggers backoff.
* - `RegistrationToken` redacts itself from Debug output. Tokens are never
*   logged and never persisted anywhere except the runner pod's environment.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::config::{OperatorConfig, SecretString};
use crate::crds::GroupIdentity;
use crate::metrics;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("job source rejected the operator credential (HTTP {0})")]
    Auth(u16),

    #[error("token exchange rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("token exchange request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed token response: {0}")]
    BadResponse(String),
}

/// A single-use runner registration token. Redacted from Debug output; the
/// inner value is only ever read when injecting the pod environment.
#[derive(Clone)]
pub struct RegistrationToken(String);

impl RegistrationToken {
    pub(crate) fn new(value: String) -> Self {
        Self(value)
    }

    /// Expose the token for pod environment injection. Callers must not log
    /// the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RegistrationToken(***)")
    }
}

/// A freshly minted token together with its expiry.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: RegistrationToken,
    pub expires_at: DateTime<Utc>,
}

/// The wire shape of the job source's token exchange endpoint.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    expires_at: String,
}

impl TokenResponse {
    fn into_minted(self) -> Result<MintedToken, TokenError> {
        let expires_at = DateTime::parse_from_rfc3339(&self.expires_at)
            .map_err(|e| TokenError::BadResponse(format!("invalid expiresAt: {}", e)))?
            .with_timezone(&Utc);

        if self.token.is_empty() {
            return Err(TokenError::BadResponse("empty token".to_string()));
        }

        Ok(MintedToken {
            token: RegistrationToken::new(self.token),
            expires_at,
        })
    }
}

/// Exchanges the operator credential for runner registration tokens.
pub struct TokenBroker {
    client: reqwest::Client,
    endpoint: String,
    credential: SecretString,
}

impl TokenBroker {
    pub fn new(config: &OperatorConfig) -> Result<Self, TokenError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.job_source_endpoint.clone(),
            credential: config.credential.clone(),
        })
    }

    /// Mints one registration token for one new runner pod.
    pub async fn mint(&self, identity: &GroupIdentity) -> Result<MintedToken, TokenError> {
        let url = format!(
            "{}/{}/actions/runners/registration-token",
            self.endpoint,
            identity.api_path()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.credential.expose())
            .query(&[("group", identity.group.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                metrics::TOKEN_MINTS_TOTAL
                    .with_label_values(&["auth_error"])
                    .inc();
                warn!(group = %identity, "Job source rejected operator credential");
                Err(TokenError::Auth(response.status().as_u16()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                metrics::TOKEN_MINTS_TOTAL
                    .with_label_values(&["rate_limited"])
                    .inc();
                let retry_after = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(TokenError::RateLimited { retry_after })
            }
            _ => {
                let response = response.error_for_status()?;
                let minted = response.json::<TokenResponse>().await?.into_minted()?;
                metrics::TOKEN_MINTS_TOTAL
                    .with_label_values(&["success"])
                    .inc();
                debug!(
                    group = %identity,
                    expires_at = %minted.expires_at,
                    "Minted registration token"
                );
                Ok(minted)
            }
        }
    }
}
