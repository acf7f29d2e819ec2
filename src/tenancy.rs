use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth_client::AuthProviderClient;
use crate::errors::AppError;
use crate::handlers::AppState;

/// Header carrying the organization the caller wants to act within.
pub const ORG_HEADER: &str = "x-org-id";

/// Membership role inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    Rep,
    Manager,
    Admin,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Rep => "rep",
            OrgRole::Manager => "manager",
            OrgRole::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "rep" => Some(OrgRole::Rep),
            "manager" => Some(OrgRole::Manager),
            "admin" => Some(OrgRole::Admin),
            _ => None,
        }
    }
}

/// The verified identity and organization of the current request.
///
/// Extracting this runs the whole tenancy chain: bearer token verification
/// against the hosted auth provider (with a short-lived token cache),
/// organization selection via the `X-Org-Id` header, and a membership
/// check against `org_members`. Handlers that take an `OrgContext`
/// argument can only ever see data of the caller's organization.
#[derive(Debug, Clone)]
pub struct OrgContext {
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub role: OrgRole,
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for OrgContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;

        let cache_key = AuthProviderClient::token_cache_key(token);
        let user = match state.token_cache.get(&cache_key).await {
            Some(user) => user,
            None => {
                let user = state.auth.fetch_user(token).await?;
                state.token_cache.insert(cache_key, user.clone()).await;
                user
            }
        };

        let org_id = parts
            .headers
            .get(ORG_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<Uuid>().ok())
            .ok_or_else(|| {
                AppError::BadRequest("Missing or invalid X-Org-Id header".to_string())
            })?;

        let role_raw: Option<String> =
            sqlx::query_scalar("SELECT role FROM org_members WHERE org_id = $1 AND user_id = $2")
                .bind(org_id)
                .bind(user.id)
                .fetch_optional(&state.db)
                .await?;

        let role_raw = role_raw.ok_or_else(|| {
            AppError::Forbidden(format!("User is not a member of organization {}", org_id))
        })?;
        let role = OrgRole::parse(&role_raw).ok_or_else(|| {
            AppError::InternalError(format!("Unknown membership role '{}'", role_raw))
        })?;

        tracing::debug!(
            "Resolved org context: user {} as {} in org {}",
            user.id,
            role.as_str(),
            org_id
        );

        Ok(OrgContext {
            org_id,
            user_id: user.id,
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts_with_auth(value: &str) -> Parts {
        let (parts, _) = Request::builder()
            .header(AUTHORIZATION, value)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_bearer_token_extraction() {
        let parts = parts_with_auth("Bearer abc123");
        assert_eq!(bearer_token(&parts), Some("abc123"));
    }

    #[test]
    fn test_bearer_token_rejects_other_schemes() {
        let parts = parts_with_auth("Basic dXNlcjpwYXNz");
        assert_eq!(bearer_token(&parts), None);
    }

    #[test]
    fn test_bearer_token_rejects_empty_token() {
        let parts = parts_with_auth("Bearer    ");
        assert_eq!(bearer_token(&parts), None);
    }

    #[test]
    fn test_bearer_token_missing_header() {
        let (parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert_eq!(bearer_token(&parts), None);
    }

    #[test]
    fn test_role_round_trips_through_strings() {
        for role in [OrgRole::Rep, OrgRole::Manager, OrgRole::Admin] {
            assert_eq!(OrgRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(OrgRole::parse("owner"), None);
    }
}
