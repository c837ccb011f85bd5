use crate::auth::AuthConfig;
use crate::target::Target;
use clap::{value_parser, Parser};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "HTTP CONNECT tunnelling proxy",
    long_about = concat!(
        "https-proxy accepts HTTP CONNECT requests and relays raw bytes between the client ",
        "and the requested (or redirected) upstream.\n\n",
        "If password and username are not set, no authentication will be required."
    )
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short = 'P', long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// IP address to bind the server
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: Ipv4Addr,

    /// Username required in Proxy-Authorization (needs --password)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// Password required in Proxy-Authorization (needs --username)
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Answer missing credentials with 407 (1) or 401 (0)
    #[arg(long, value_parser = value_parser!(u8).range(0..=1), default_value_t = 1)]
    pub challenge: u8,

    /// Target URL to forward every tunnel to, regardless of the requested host
    #[arg(short = 't', long, value_name = "URL")]
    pub target: Option<Target>,

    /// Milliseconds unfinished handshakes get to complete once the server stops
    #[arg(long = "shutdown-timeout-ms", default_value_t = 1000)]
    pub shutdown_timeout_ms: u64,

    /// Seconds to wait for open tunnels on SIGINT/SIGTERM before closing them
    #[arg(long = "drain-timeout", default_value_t = 0)]
    pub drain_timeout: u64,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub auth: Option<AuthConfig>,
    pub redirect: Option<Target>,
    pub shutdown_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            auth: None,
            redirect: None,
            shutdown_timeout: Duration::from_millis(1000),
            drain_timeout: Duration::ZERO,
        }
    }
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let listen_addr = SocketAddr::from((args.listen_ip, args.port));

        let auth = match (args.username, args.password) {
            (Some(username), Some(password)) => {
                Some(AuthConfig::new(username, password, args.challenge == 1))
            }
            (None, None) => None,
            _ => {
                return Err(color_eyre::eyre::eyre!(
                    "Password and username are both required for authentication."
                ))
            }
        };

        Ok(Self {
            listen_addr,
            auth,
            redirect: args.target,
            shutdown_timeout: Duration::from_millis(args.shutdown_timeout_ms),
            drain_timeout: Duration::from_secs(args.drain_timeout),
        })
    }

    /// Credentials in force, if any.
    ///
    /// Empty username or password counts as authentication disabled.
    pub fn auth(&self) -> Option<&AuthConfig> {
        self.auth.as_ref().filter(|auth| auth.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> color_eyre::Result<ProxyConfig> {
        let mut argv = vec!["https-proxy"];
        argv.extend_from_slice(args);
        ProxyConfig::from_cli(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert!(config.auth().is_none());
        assert!(config.redirect.is_none());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.drain_timeout, Duration::ZERO);
    }

    #[test]
    fn credentials_and_challenge() {
        let config = parse(&["-u", "user", "-p", "pass", "-P", "3128"]).unwrap();
        assert_eq!(config.listen_addr.port(), 3128);
        let auth = config.auth().unwrap();
        assert_eq!(auth.username, "user");
        assert_eq!(auth.password, "pass");
        assert!(auth.challenge);

        let config = parse(&["-u", "user", "-p", "pass", "--challenge", "0"]).unwrap();
        assert!(!config.auth().unwrap().challenge);

        assert!(parse(&["--challenge", "2"]).is_err());
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        assert!(parse(&["-u", "user"]).is_err());
        assert!(parse(&["--password", "pass"]).is_err());
    }

    #[test]
    fn empty_credentials_disable_auth() {
        let config = parse(&["-u", "", "-p", "pass"]).unwrap();
        assert!(config.auth.is_some());
        assert!(config.auth().is_none());
    }

    #[test]
    fn redirect_target() {
        let config = parse(&["-t", "https://example.com"]).unwrap();
        assert_eq!(config.redirect, Some(Target::new("example.com", 443)));

        let config = parse(&["--target", "internal.local:9000"]).unwrap();
        assert_eq!(config.redirect, Some(Target::new("internal.local", 9000)));

        let err = Cli::try_parse_from(["https-proxy", "--target", "https://"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
