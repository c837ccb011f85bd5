use crate::auth;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::target::{self, Target};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE, PROXY_AUTHENTICATE};
use hyper::{Response, StatusCode};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Value of the `Proxy-agent` header sent with `200 Connection Established`.
pub const PROXY_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const PROXY_AGENT_HEADER: &str = "proxy-agent";
const PROXY_CONNECTION_HEADER: &str = "proxy-connection";

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Start,
    Authenticating,
    Resolving,
    Dialing,
    Established,
    Rejected,
    Failed,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TunnelState::Established | TunnelState::Rejected | TunnelState::Failed
        )
    }
}

/// State machine for one CONNECT request.
///
/// Walks `Start -> Authenticating -> Resolving -> Dialing -> Established`,
/// or stops in `Rejected` (bad or missing credentials) or `Failed` (bad
/// target, upstream unreachable). Only the dial suspends.
pub struct TunnelHandshake<'a> {
    config: &'a ProxyConfig,
    peer: SocketAddr,
    state: TunnelState,
}

impl<'a> TunnelHandshake<'a> {
    pub fn new(config: &'a ProxyConfig, peer: SocketAddr) -> Self {
        Self {
            config,
            peer,
            state: TunnelState::Start,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        trace!("{} handshake {:?} -> {:?}", self.peer, self.state, next);
        if next.is_terminal() {
            debug!("{} handshake finished: {:?}", self.peer, next);
        }
        self.state = next;
    }

    fn assert_state(&self, expected: TunnelState, step: &str) {
        debug_assert_eq!(self.state, expected, "handshake step {} out of order", step);
    }

    /// Check the `Proxy-Authorization` header.
    ///
    /// With authentication disabled this goes straight to `Resolving`.
    pub fn authenticate(&mut self, header: Option<&HeaderValue>) -> ProxyResult<()> {
        self.assert_state(TunnelState::Start, "authenticate");

        let Some(auth_config) = self.config.auth() else {
            self.transition(TunnelState::Resolving);
            return Ok(());
        };

        self.transition(TunnelState::Authenticating);
        match auth::authorize(header, Some(auth_config)) {
            Ok(()) => {
                self.transition(TunnelState::Resolving);
                Ok(())
            }
            Err(e) => {
                debug!("{} rejected: {}", self.peer, e);
                self.transition(TunnelState::Rejected);
                Err(e)
            }
        }
    }

    /// Work out the upstream, honouring a configured redirect.
    pub fn resolve(&mut self, connect_authority: &str) -> ProxyResult<Target> {
        self.assert_state(TunnelState::Resolving, "resolve");

        match target::resolve(connect_authority, self.config.redirect.as_ref()) {
            Ok(target) => {
                self.transition(TunnelState::Dialing);
                Ok(target)
            }
            Err(e) => {
                self.transition(TunnelState::Failed);
                Err(e)
            }
        }
    }

    /// Open the upstream TCP connection. No retries.
    pub async fn dial(&mut self, target: &Target) -> ProxyResult<TcpStream> {
        self.assert_state(TunnelState::Dialing, "dial");

        match TcpStream::connect((target.host.as_str(), target.port)).await {
            Ok(stream) => {
                debug!("{} connected to upstream {}", self.peer, target);
                self.transition(TunnelState::Established);
                Ok(stream)
            }
            Err(source) => {
                self.transition(TunnelState::Failed);
                Err(ProxyError::DialFailure {
                    target: target.to_string(),
                    source,
                })
            }
        }
    }

    /// Run authenticate, resolve and dial in order.
    pub async fn run(
        &mut self,
        proxy_authorization: Option<&HeaderValue>,
        connect_authority: &str,
    ) -> ProxyResult<(Target, TcpStream)> {
        self.authenticate(proxy_authorization)?;
        let target = self.resolve(connect_authority)?;
        let upstream = self.dial(&target).await?;
        Ok((target, upstream))
    }
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// `200 Connection Established`; the tunnel starts right after it.
pub fn established_response() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response.headers_mut().insert(
        HeaderName::from_static(PROXY_AGENT_HEADER),
        HeaderValue::from_static(PROXY_AGENT),
    );
    response
}

fn closing(mut response: Response<ProxyBody>, status: StatusCode) -> Response<ProxyBody> {
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// `405` for anything that is not CONNECT.
pub fn method_not_allowed_response() -> Response<ProxyBody> {
    let mut response = closing(
        Response::new(full("Method not allowed")),
        StatusCode::METHOD_NOT_ALLOWED,
    );
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Status response for a handshake that did not reach `Established`.
///
/// The client connection is closed once it has been written.
pub fn rejection_response(error: &ProxyError) -> Response<ProxyBody> {
    match error {
        ProxyError::AuthRequired | ProxyError::AuthInvalid => {
            let mut response = closing(Response::new(empty()), error.status());
            let headers = response.headers_mut();
            headers.insert(
                PROXY_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"proxy\""),
            );
            headers.insert(
                HeaderName::from_static(PROXY_CONNECTION_HEADER),
                HeaderValue::from_static("close"),
            );
            response
        }
        ProxyError::InvalidTarget(_) => closing(Response::new(empty()), StatusCode::BAD_REQUEST),
        _ => {
            let detail = error.detail();
            let mut response = closing(
                Response::new(full(detail.clone())),
                StatusCode::INTERNAL_SERVER_ERROR,
            );
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            if let Ok(reason) = ReasonPhrase::try_from(detail) {
                response.extensions_mut().insert(reason);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use base64::engine::general_purpose;
    use base64::Engine;
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn auth_config(challenge: bool) -> ProxyConfig {
        ProxyConfig {
            auth: Some(AuthConfig::new(
                "user".to_string(),
                "pass".to_string(),
                challenge,
            )),
            ..ProxyConfig::default()
        }
    }

    fn credentials(username: &str, password: &str) -> HeaderValue {
        let encoded = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap()
    }

    #[test]
    fn test_auth_disabled_skips_to_resolving() {
        let config = ProxyConfig::default();
        let mut handshake = TunnelHandshake::new(&config, peer());
        let garbage = HeaderValue::from_static("Basic !!!");

        handshake.authenticate(Some(&garbage)).unwrap();
        assert_eq!(handshake.state(), TunnelState::Resolving);
    }

    #[test]
    fn test_missing_credentials_with_challenge_is_rejected() {
        let config = auth_config(true);
        let mut handshake = TunnelHandshake::new(&config, peer());

        let err = handshake.authenticate(None).unwrap_err();
        assert!(matches!(err, ProxyError::AuthRequired));
        assert_eq!(handshake.state(), TunnelState::Rejected);
        assert!(handshake.state().is_terminal());
    }

    #[test]
    fn test_wrong_credentials_are_rejected() {
        let config = auth_config(true);
        let mut handshake = TunnelHandshake::new(&config, peer());

        let err = handshake
            .authenticate(Some(&credentials("user", "wrong")))
            .unwrap_err();
        assert!(matches!(err, ProxyError::AuthInvalid));
        assert_eq!(handshake.state(), TunnelState::Rejected);
    }

    #[test]
    fn test_invalid_target_fails() {
        let config = ProxyConfig::default();
        let mut handshake = TunnelHandshake::new(&config, peer());
        handshake.authenticate(None).unwrap();

        let err = handshake.resolve("").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget(_)));
        assert_eq!(handshake.state(), TunnelState::Failed);
    }

    #[tokio::test]
    async fn test_run_reaches_established() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = auth_config(true);
        let mut handshake = TunnelHandshake::new(&config, peer());

        let (target, _upstream) = handshake
            .run(Some(&credentials("user", "pass")), &addr.to_string())
            .await
            .unwrap();
        assert_eq!(target, Target::new("127.0.0.1", addr.port()));
        assert_eq!(handshake.state(), TunnelState::Established);
    }

    #[tokio::test]
    async fn test_redirect_wins_over_requested_authority() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = ProxyConfig {
            redirect: Some(Target::new("127.0.0.1", addr.port())),
            ..ProxyConfig::default()
        };
        let mut handshake = TunnelHandshake::new(&config, peer());

        let (target, _upstream) = handshake.run(None, "anything.invalid:443").await.unwrap();
        assert_eq!(target.port, addr.port());
    }

    #[tokio::test]
    async fn test_dial_failure() {
        // Grab a free port and release it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ProxyConfig::default();
        let mut handshake = TunnelHandshake::new(&config, peer());
        let err = handshake.run(None, &addr.to_string()).await.unwrap_err();

        assert!(matches!(err, ProxyError::DialFailure { .. }));
        assert_eq!(handshake.state(), TunnelState::Failed);
        assert_eq!(rejection_response(&err).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rejection_responses() {
        let response = rejection_response(&ProxyError::AuthRequired);
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers().get(PROXY_AUTHENTICATE).unwrap(),
            "Basic realm=\"proxy\""
        );
        assert_eq!(response.headers().get("proxy-connection").unwrap(), "close");

        let response = rejection_response(&ProxyError::AuthInvalid);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(PROXY_AUTHENTICATE));

        let response = rejection_response(&ProxyError::InvalidTarget(String::new()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");

        let response = method_not_allowed_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn test_established_response() {
        let response = established_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(CONNECTION));
        assert_eq!(response.headers().get("proxy-agent").unwrap(), PROXY_AGENT);
        assert_eq!(
            response.extensions().get::<ReasonPhrase>().unwrap().as_bytes(),
            b"Connection Established"
        );
    }
}
