//! Bearer-credential resolution.
//!
//! One authoritative path: exact service-secret match, then a verified JWT
//! role-claim check (service role only), then the personal-access-token
//! table. A JWT `sub` claim is never used as a user identity — only the
//! token table may assert one.

use crate::api::ApiError;
use crate::config::DaemonConfig;
use crate::db::Db;
use axum::http::{header, HeaderMap};
use dispatch_core::model::Id;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// Resolved caller identity for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Cloud fleet: global scope, no owning user.
    ServiceRole,
    User(Id),
}

impl Caller {
    pub fn is_service(&self) -> bool {
        matches!(self, Caller::ServiceRole)
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Caller::ServiceRole => None,
            Caller::User(id) => Some(id),
        }
    }
}

const SERVICE_ROLES: [&str; 2] = ["service_role", "supabase_admin"];

#[derive(Debug, Deserialize)]
struct RoleClaims {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    app_metadata: Option<AppMetadata>,
}

#[derive(Debug, Deserialize)]
struct AppMetadata {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Clone)]
pub struct Authenticator {
    service_role_secret: String,
    jwt_secret: Option<String>,
}

impl Authenticator {
    pub fn new(config: &DaemonConfig) -> Self {
        Self {
            service_role_secret: config.service_role_secret.clone(),
            jwt_secret: config.jwt_secret.clone(),
        }
    }

    /// Resolve the request's bearer credential. Nothing is cached beyond the
    /// request.
    pub async fn resolve(&self, db: &Db, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let token = bearer(headers)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer credential".into()))?;

        if token == self.service_role_secret {
            return Ok(Caller::ServiceRole);
        }
        if self.is_service_jwt(token) {
            return Ok(Caller::ServiceRole);
        }

        match db.token_user(token).await.map_err(ApiError::internal)? {
            Some(user_id) => Ok(Caller::User(user_id)),
            None => Err(ApiError::Forbidden(
                "credential does not resolve to a user".into(),
            )),
        }
    }

    /// Verified JWT whose role claim names a service role. Tokens that do not
    /// verify against the configured secret grant nothing and fall through to
    /// the access-token lookup.
    fn is_service_jwt(&self, token: &str) -> bool {
        let Some(secret) = &self.jwt_secret else {
            return false;
        };
        if token.split('.').count() != 3 {
            return false;
        }
        let mut validation = Validation::new(Algorithm::HS256);
        // Service keys are long-lived; exp may be far out or absent.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let decoded = jsonwebtoken::decode::<RoleClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        );
        let Ok(data) = decoded else {
            return false;
        };
        let role = data
            .claims
            .role
            .or(data.claims.app_metadata.and_then(|m| m.role));
        role.is_some_and(|r| SERVICE_ROLES.contains(&r.as_str()))
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}
