use crate::error::{ProxyError, ProxyResult};
use std::fmt;
use std::str::FromStr;

/// Port used when the CONNECT authority or redirect target carries none.
pub const DEFAULT_TUNNEL_PORT: u16 = 443;

/// Upstream host and port a tunnel is dialed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Hostname or IP literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse an authority of the form `host[:port]`.
    ///
    /// A missing or non-numeric port falls back to [`DEFAULT_TUNNEL_PORT`].
    /// Bracketed IPv6 literals (`[::1]:8443`) are accepted.
    pub fn from_authority(authority: &str) -> ProxyResult<Self> {
        let invalid = || ProxyError::InvalidTarget(authority.to_string());
        let authority = authority.trim();

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => parse_port(port),
                None if after.is_empty() => DEFAULT_TUNNEL_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                // Bare IPv6 literal without brackets.
                Some((host, _)) if host.contains(':') => (authority, DEFAULT_TUNNEL_PORT),
                Some((host, port)) => (host, parse_port(port)),
                None => (authority, DEFAULT_TUNNEL_PORT),
            }
        };

        if !is_valid_host(host) {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }

    /// Parse a configured redirect target.
    ///
    /// Accepts a bare authority (`internal.local:9000`) as well as a URL
    /// (`https://example.com/path`); scheme, userinfo and path are ignored.
    pub fn from_redirect(target: &str) -> ProxyResult<Self> {
        let rest = match target.trim().split_once("://") {
            Some((_scheme, rest)) => rest,
            None => target.trim(),
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        let authority = match authority.rsplit_once('@') {
            Some((_userinfo, host)) => host,
            None => authority,
        };
        Self::from_authority(authority).map_err(|_| ProxyError::InvalidTarget(target.to_string()))
    }
}

impl FromStr for Target {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_redirect(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Decide where a tunnel goes.
///
/// A configured redirect always wins and the requested authority is not even
/// looked at; otherwise the CONNECT authority is parsed.
pub fn resolve(connect_authority: &str, redirect: Option<&Target>) -> ProxyResult<Target> {
    match redirect {
        Some(target) => Ok(target.clone()),
        None => Target::from_authority(connect_authority),
    }
}

fn parse_port(port: &str) -> u16 {
    port.parse::<u16>().unwrap_or(DEFAULT_TUNNEL_PORT)
}

fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && !host.chars().any(|c| {
            c.is_whitespace()
                || c.is_control()
                || matches!(c, '/' | '?' | '#' | '@' | '[' | ']')
        })
}
