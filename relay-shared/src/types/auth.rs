use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Claims carried by the bearer token the admin API accepts.
///
/// Token issuance lives outside this engine (it's explicitly out of scope) —
/// this is a decode-only consumer of whatever upstream service mints the
/// token, as long as it's signed with the shared `jwt_secret` and carries a
/// `tenant_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// The authenticated caller of the admin API, resolved from a bearer token.
///
/// Every C1/Admin operation that takes a `tenant_id` takes it from here, not
/// from a request body or query string — a caller can never act on another
/// tenant's resources by supplying a different id in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantPrincipal {
    pub tenant_id: String,
}

impl From<Claims> for TenantPrincipal {
    fn from(claims: Claims) -> Self {
        Self {
            tenant_id: claims.tenant_id,
        }
    }
}
