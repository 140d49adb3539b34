//! Manager-token payload.
//!
//! The token itself is `base64url(header).base64url(payload).base64url(sig)`
//! with an HMAC-SHA256 signature; see `presence_auth` for verification. This
//! module only models the payload JSON.

use serde::{Deserialize, Serialize};

/// Claims carried by a manager token. Every field is optional; unknown
/// fields are preserved in `extra` so issuers can extend the payload without
/// breaking verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagerTokenPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub office_id: Option<String>,
    /// Expiry, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ManagerTokenPayload {
    /// The namespace claim under either of its accepted names.
    pub fn namespace_claim(&self) -> Option<&str> {
        self.namespace
            .as_deref()
            .or(self.namespace_slug.as_deref())
    }
}
