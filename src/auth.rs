use crate::error::{ProxyError, ProxyResult};
use base64::engine::general_purpose;
use base64::Engine;
use hyper::header::HeaderValue;

/// Configured proxy credentials
#[derive(Clone)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Answer missing credentials with 407 instead of 401.
    pub challenge: bool,
}

impl AuthConfig {
    pub fn new(username: String, password: String, challenge: bool) -> Self {
        Self {
            username,
            password,
            challenge,
        }
    }

    /// Authentication only applies when both halves are non-empty.
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Every byte position up to the longer input is visited and folded into a
/// single OR accumulator, together with the length difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len = a.len().max(b.len());
    let mut diff = a.len() ^ b.len();
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

/// Decode a `Basic` credential header into `(username, password)`.
///
/// The scheme is matched case-insensitively. The username ends at the first
/// `:`, so the password may itself contain colons.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

/// Check a `Proxy-Authorization` value against the configured credentials.
///
/// The value must be `Basic <base64(username:password)>`; each half is
/// compared with [`constant_time_eq`].
pub fn validate(header: Option<&str>, config: &AuthConfig) -> bool {
    let Some((username, password)) = header.and_then(parse_basic) else {
        return false;
    };

    let user_match = constant_time_eq(username.as_bytes(), config.username.as_bytes());
    let pass_match = constant_time_eq(password.as_bytes(), config.password.as_bytes());
    user_match & pass_match
}

/// Authentication step of the tunnel handshake.
///
/// | header | valid | challenge | result |
/// |---|---|---|---|
/// | absent | - | on | [`ProxyError::AuthRequired`] |
/// | absent | - | off | [`ProxyError::AuthInvalid`] |
/// | present | no | - | [`ProxyError::AuthInvalid`] |
/// | present | yes | - | `Ok` |
///
/// With no (or an incomplete) [`AuthConfig`] every request passes.
pub fn authorize(header: Option<&HeaderValue>, config: Option<&AuthConfig>) -> ProxyResult<()> {
    let Some(config) = config.filter(|c| c.is_enabled()) else {
        return Ok(());
    };

    match header {
        None if config.challenge => Err(ProxyError::AuthRequired),
        None => Err(ProxyError::AuthInvalid),
        Some(value) => {
            // Non-visible-ASCII header values can never be valid base64.
            if validate(value.to_str().ok(), config) {
                Ok(())
            } else {
                Err(ProxyError::AuthInvalid)
            }
        }
    }
}
