//! Server configuration.
//!
//! The core defines no environment variables of its own; the binary layer
//! supplies parsed values (flags, env, `.env`) and this module resolves them
//! into a usable RPC configuration, including Bitcoin Core `.cookie`
//! credentials.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default reassembly timeout when nothing is configured.
pub const DEFAULT_REASSEMBLY_TIMEOUT_SECS: u64 = 300;

/// Reassembly timeout from an optional configured value, clamping zero and
/// absence to the default.
pub fn reassembly_timeout(configured_secs: Option<u64>) -> Duration {
    let secs = configured_secs
        .filter(|&secs| secs > 0)
        .unwrap_or(DEFAULT_REASSEMBLY_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Connection parameters for the Bitcoin Core endpoint.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// RPC host, default `127.0.0.1`.
    pub host: String,
    /// RPC port, default `8332`.
    pub port: u16,
    /// RPC username.
    pub user: String,
    /// RPC password.
    pub password: String,
}

impl RpcConfig {
    /// Resolve a configuration from individually optional values.
    ///
    /// A cookie file wins over explicit user/password; with neither, the
    /// configuration is an error rather than a guess.
    pub fn resolve(
        host: Option<String>,
        port: Option<u16>,
        user: Option<String>,
        password: Option<String>,
        cookie_file: Option<&str>,
    ) -> Result<Self> {
        let (user, password) = match cookie_file {
            Some(path) => read_cookie_file(path)?,
            None => match (user, password) {
                (Some(user), Some(password)) => (user, password),
                _ => {
                    return Err(Error::Config(
                        "missing RPC credentials: provide a cookie file or user and password"
                            .into(),
                    ))
                }
            },
        };
        Ok(Self {
            host: host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: port.unwrap_or(8332),
            user,
            password,
        })
    }

    /// The endpoint URL without credentials.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.port)
    }
}

/// Read `user:password` from a Bitcoin Core `.cookie` file.
pub fn read_cookie_file(path: &str) -> Result<(String, String)> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cookie file {path}: {e}")))?;
    let trimmed = contents.trim();
    let (user, password) = trimmed
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("cookie file {path} is not user:password")))?;
    Ok((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_url_shape() {
        let config = RpcConfig {
            host: "10.0.0.2".into(),
            port: 18443,
            user: "u".into(),
            password: "p".into(),
        };
        assert_eq!(config.url(), "http://10.0.0.2:18443/");
    }

    #[test]
    fn test_resolve_defaults_host_and_port() {
        let config =
            RpcConfig::resolve(None, None, Some("u".into()), Some("p".into()), None)
                .expect("resolve");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8332);
    }

    #[test]
    fn test_resolve_requires_credentials() {
        assert!(RpcConfig::resolve(None, None, None, None, None).is_err());
        assert!(RpcConfig::resolve(None, None, Some("u".into()), None, None).is_err());
    }

    #[test]
    fn test_cookie_wins_over_user_password() {
        let (path, mut file) = tempfile_path("btcmesh-cookie-wins");
        writeln!(file, "__cookie__:s3cretvalue").expect("write");
        let config = RpcConfig::resolve(
            None,
            None,
            Some("ignored".into()),
            Some("ignored".into()),
            Some(&path),
        )
        .expect("resolve");
        assert_eq!(config.user, "__cookie__");
        assert_eq!(config.password, "s3cretvalue");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_cookie_file_without_separator() {
        let (path, mut file) = tempfile_path("btcmesh-cookie-bad");
        writeln!(file, "nocolonhere").expect("write");
        assert!(read_cookie_file(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_cookie_file_missing() {
        assert!(read_cookie_file("/nonexistent/btcmesh.cookie").is_err());
    }

    #[test]
    fn test_reassembly_timeout_fallbacks() {
        assert_eq!(reassembly_timeout(None), Duration::from_secs(300));
        assert_eq!(reassembly_timeout(Some(0)), Duration::from_secs(300));
        assert_eq!(reassembly_timeout(Some(60)), Duration::from_secs(60));
    }

    fn tempfile_path(name: &str) -> (String, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        let file = std::fs::File::create(&path).expect("create temp file");
        (path, file)
    }
}
