use failsafe::backoff::Exponential;
use failsafe::failure_policy::ConsecutiveFailures;
use failsafe::futures::CircuitBreaker;
use failsafe::{backoff, failure_policy, StateMachine};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::AppError;

type ProviderBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

/// Creates the circuit breaker guarding calls to the hosted auth provider.
///
/// Five consecutive provider failures open the circuit; recovery attempts
/// back off exponentially between 10s and 60s. Token rejections (401/403)
/// do not count as failures, only transport errors and 5xx responses do.
fn provider_circuit_breaker() -> ProviderBreaker {
    let backoff_strategy = backoff::exponential(
        Duration::from_secs(10), // Initial delay
        Duration::from_secs(60), // Maximum delay
    );

    let policy = failure_policy::consecutive_failures(5, backoff_strategy);

    failsafe::Config::new().failure_policy(policy).build()
}

/// The identity the auth provider reports for a bearer token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: Option<String>,
}

/// Client for the hosted auth provider's user endpoint.
///
/// Verifies bearer tokens by asking the provider who they belong to.
/// Cloning shares the underlying connection pool and circuit breaker.
#[derive(Clone)]
pub struct AuthProviderClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    breaker: ProviderBreaker,
}

impl AuthProviderClient {
    pub fn new(base_url: String, service_key: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::AuthProviderError(format!("Failed to build auth HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            service_key,
            breaker: provider_circuit_breaker(),
        })
    }

    /// Cache key for a bearer token.
    ///
    /// Tokens are never stored verbatim; the cache is keyed by their SHA-256
    /// digest so a heap dump cannot leak usable credentials.
    pub fn token_cache_key(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Resolves a bearer token to the user it belongs to.
    ///
    /// Returns `Unauthorized` when the provider rejects the token and
    /// `AuthProviderError` when the provider itself misbehaves or the
    /// circuit is open.
    pub async fn fetch_user(&self, bearer_token: &str) -> Result<AuthUser, AppError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        let request = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", bearer_token))
            .header("apikey", &self.service_key);

        let outcome = self
            .breaker
            .call_with(
                |err: &AppError| matches!(err, AppError::AuthProviderError(_)),
                async move {
                    let response = request.send().await.map_err(|e| {
                        AppError::AuthProviderError(format!("Auth provider request failed: {}", e))
                    })?;

                    let status = response.status();
                    if status.is_success() {
                        response.json::<AuthUser>().await.map_err(|e| {
                            AppError::AuthProviderError(format!(
                                "Failed to parse auth provider response: {}",
                                e
                            ))
                        })
                    } else if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        Err(AppError::Unauthorized(
                            "Token rejected by auth provider".to_string(),
                        ))
                    } else {
                        let body = response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unknown error".to_string());
                        Err(AppError::AuthProviderError(format!(
                            "Auth provider returned {}: {}",
                            status, body
                        )))
                    }
                },
            )
            .await;

        match outcome {
            Ok(user) => Ok(user),
            Err(failsafe::Error::Inner(e)) => Err(e),
            Err(failsafe::Error::Rejected) => {
                tracing::warn!("Auth provider circuit open; failing token verification fast");
                Err(AppError::AuthProviderError(
                    "Auth provider temporarily unavailable".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{provider_circuit_breaker, AuthProviderClient};
    use failsafe::{CircuitBreaker, Error};

    #[test]
    fn test_breaker_opens_after_consecutive_failures() {
        let cb = provider_circuit_breaker();

        for _ in 0..5 {
            let result: Result<(), Error<&str>> = cb.call(|| Err::<(), &str>("provider down"));
            assert!(result.is_err());
        }

        let result: Result<(), Error<&str>> = cb.call(|| Ok::<(), &str>(()));
        match result {
            Err(Error::Rejected) => {}
            _ => panic!("Expected open circuit to reject the call"),
        }
    }

    #[test]
    fn test_breaker_passes_successes_through() {
        let cb = provider_circuit_breaker();

        let result: Result<i32, Error<&str>> = cb.call(|| Ok::<i32, &str>(42));

        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_token_cache_key_is_stable_and_opaque() {
        let key1 = AuthProviderClient::token_cache_key("secret-token");
        let key2 = AuthProviderClient::token_cache_key("secret-token");
        let other = AuthProviderClient::token_cache_key("other-token");

        assert_eq!(key1, key2);
        assert_ne!(key1, other);
        assert_eq!(key1.len(), 64);
        assert!(!key1.contains("secret"));
    }
}
