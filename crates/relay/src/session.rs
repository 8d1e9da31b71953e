//! Channel and session extraction from upgrade requests.
//!
//! The channel is the request path, verbatim. The session comes from a
//! JWT-shaped token in a cookie whose payload is decoded **without verifying
//! the signature**: the claimed reference id and roles are trusted as-is.
//! Anything that fails to decode yields an anonymous connection.

use axum::http::{HeaderMap, Uri};
use axum_extra::extract::cookie::CookieJar;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Role tags recognized in session tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Learner,
    Instructor,
}

impl Role {
    /// Map a role claim to a role.
    ///
    /// Accepts the bare name (`Learner`) or a LIS role URI ending in it
    /// (`http://purl.imsglobal.org/vocab/lis/v2/membership#Learner`).
    pub fn from_claim(claim: &str) -> Option<Self> {
        let name = claim.rsplit(|c: char| c == '#' || c == '/').next().unwrap_or(claim);
        match name {
            "Learner" => Some(Self::Learner),
            "Instructor" => Some(Self::Instructor),
            _ => None,
        }
    }
}

/// Identity claimed by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub ref_id: Option<String>,
    pub roles: Vec<Role>,
}

impl Session {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Reference id to announce on the roster, if this session joins it.
    ///
    /// Only learners with a non-empty reference id are announced.
    pub fn roster_ref_id(&self) -> Option<&str> {
        match self.ref_id.as_deref() {
            Some(ref_id) if !ref_id.is_empty() && self.has_role(Role::Learner) => Some(ref_id),
            _ => None,
        }
    }
}

/// Why a token did not produce a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("token is not a three-part JWT")]
    Malformed,

    #[error("payload is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not a claims object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token carries no reference id and no known role")]
    NoClaims,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(rename = "refId", default)]
    ref_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Decode the session claims from a token, without signature verification.
pub fn decode_token(token: &str) -> Result<Session, SessionError> {
    // JWT format: header.payload.signature
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(SessionError::Malformed);
    }

    let payload = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('='))?;
    let claims: Claims = serde_json::from_slice(&payload)?;

    let mut roles = Vec::new();
    for role in claims.roles.iter().filter_map(|r| Role::from_claim(r)) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }

    if claims.ref_id.is_none() && roles.is_empty() {
        return Err(SessionError::NoClaims);
    }

    Ok(Session {
        ref_id: claims.ref_id,
        roles,
    })
}

/// Read the session from the named cookie; `None` when absent or undecodable.
pub fn session_from_headers(headers: &HeaderMap, cookie_name: &str) -> Option<Session> {
    let jar = CookieJar::from_headers(headers);
    let token = match jar.get(cookie_name) {
        Some(cookie) => cookie.value().to_string(),
        None => {
            debug!("No '{}' cookie, anonymous connection", cookie_name);
            return None;
        }
    };

    match decode_token(&token) {
        Ok(session) => Some(session),
        Err(e) => {
            debug!("Ignoring session cookie '{}': {}", cookie_name, e);
            None
        }
    }
}

/// Derive the channel and optional session for an upgrade request.
pub fn extract(uri: &Uri, headers: &HeaderMap, cookie_name: &str) -> (String, Option<Session>) {
    let channel = uri.path().to_string();
    let session = session_from_headers(headers, cookie_name);
    (channel, session)
}
