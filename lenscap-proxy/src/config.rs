use std::{fs, time::Duration};

use clap::Parser;
use serde::Deserialize;

use crate::errors::ProxyError;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
  #[arg(short, long, default_value = "lenscap.toml")]
  pub config: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
  /// Address the listener binds
  pub listen_addr: String,
  /// Preferred port; 0 requests an ephemeral port
  pub listen_port: u16,

  /// Upstream HTTP proxy; empty host means direct connections
  pub upstream_proxy_host: String,
  pub upstream_proxy_port: u16,

  /// Hosts never TLS-intercepted; `*.example.com` wildcards allowed
  pub excluded_hosts: Vec<String>,
  pub intercept_tls:  bool,

  /// Cap on captured request/response body bytes
  pub max_body_bytes: usize,
  /// Leaf cache eviction hint in seconds
  pub cache_ttl_secs: u64,
  /// Traffic store retention cap
  pub max_records:    usize,

  /// Directory for the secret store and traffic.db
  pub state_dir: String,
  /// Extra PEM/DER root certificates trusted when connecting out
  pub extra_root_certificates: Vec<String>,

  pub classify_timeout_secs: u64,
  pub response_timeout_secs: u64,
  pub tunnel_idle_timeout_secs: u64,
  pub tls_handshake_timeout_secs: u64,
  pub upstream_connect_timeout_secs: u64,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      listen_addr: "127.0.0.1".to_string(),
      listen_port: 0,
      upstream_proxy_host: String::new(),
      upstream_proxy_port: 0,
      excluded_hosts: Vec::new(),
      intercept_tls: true,
      max_body_bytes: 1024 * 1024,
      cache_ttl_secs: 3600,
      max_records: 1000,
      state_dir: ".lenscap".to_string(),
      extra_root_certificates: Vec::new(),
      classify_timeout_secs: 10,
      response_timeout_secs: 30,
      tunnel_idle_timeout_secs: 120,
      tls_handshake_timeout_secs: 15,
      upstream_connect_timeout_secs: 10,
    }
  }
}

/// Layered configuration: built-in defaults, then the TOML file when it
/// exists, then `LENSCAP_*` environment overrides.
pub fn read_config(path: &str) -> Result<Config, ProxyError> {
  let defaults = Config::default();
  let builder = config::Config::builder()
    .set_default("listen_addr", defaults.listen_addr.clone())
    .and_then(|b| b.set_default("listen_port", defaults.listen_port as u64))
    .and_then(|b| b.set_default("upstream_proxy_host", defaults.upstream_proxy_host.clone()))
    .and_then(|b| b.set_default("upstream_proxy_port", defaults.upstream_proxy_port as u64))
    .and_then(|b| b.set_default("excluded_hosts", Vec::<String>::new()))
    .and_then(|b| b.set_default("intercept_tls", defaults.intercept_tls))
    .and_then(|b| b.set_default("max_body_bytes", defaults.max_body_bytes as u64))
    .and_then(|b| b.set_default("cache_ttl_secs", defaults.cache_ttl_secs))
    .and_then(|b| b.set_default("max_records", defaults.max_records as u64))
    .and_then(|b| b.set_default("state_dir", defaults.state_dir.clone()))
    .and_then(|b| b.set_default("extra_root_certificates", Vec::<String>::new()))
    .and_then(|b| b.set_default("classify_timeout_secs", defaults.classify_timeout_secs))
    .and_then(|b| b.set_default("response_timeout_secs", defaults.response_timeout_secs))
    .and_then(|b| b.set_default("tunnel_idle_timeout_secs", defaults.tunnel_idle_timeout_secs))
    .and_then(|b| b.set_default("tls_handshake_timeout_secs", defaults.tls_handshake_timeout_secs))
    .and_then(|b| {
      b.set_default("upstream_connect_timeout_secs", defaults.upstream_connect_timeout_secs)
    })
    .map_err(|e| ProxyError::Config(e.to_string()))?;

  let builder = if fs::metadata(path).is_ok() {
    builder.add_source(config::File::new(path, config::FileFormat::Toml))
  } else {
    builder
  };
  let builder =
    builder.add_source(config::Environment::with_prefix("LENSCAP").try_parsing(true));

  let parsed: Config = builder
    .build()
    .and_then(|c| c.try_deserialize())
    .map_err(|e| ProxyError::Config(e.to_string()))?;
  parsed.validate()?;
  Ok(parsed)
}

impl Config {
  pub fn validate(&self) -> Result<(), ProxyError> {
    if !self.upstream_proxy_host.is_empty() && self.upstream_proxy_port == 0 {
      return Err(ProxyError::Config("upstream_proxy_port is required with a proxy host".into()));
    }
    if self.max_body_bytes == 0 {
      return Err(ProxyError::Config("max_body_bytes must be positive".into()));
    }
    Ok(())
  }

  pub fn upstream_proxy(&self) -> Option<(&str, u16)> {
    if self.upstream_proxy_host.is_empty() {
      None
    } else {
      Some((self.upstream_proxy_host.as_str(), self.upstream_proxy_port))
    }
  }

  /// Hosts on the exclusion list bypass TLS interception. A wildcard pattern
  /// covers both the subdomains and the apex.
  pub fn is_excluded(&self, host: &str) -> bool {
    self.excluded_hosts.iter().any(|pattern| host_matches(pattern, host))
  }

  pub fn classify_timeout(&self) -> Duration { Duration::from_secs(self.classify_timeout_secs) }

  pub fn response_timeout(&self) -> Duration { Duration::from_secs(self.response_timeout_secs) }

  pub fn tunnel_idle_timeout(&self) -> Duration {
    Duration::from_secs(self.tunnel_idle_timeout_secs)
  }

  pub fn tls_handshake_timeout(&self) -> Duration {
    Duration::from_secs(self.tls_handshake_timeout_secs)
  }

  pub fn upstream_connect_timeout(&self) -> Duration {
    Duration::from_secs(self.upstream_connect_timeout_secs)
  }
}

fn host_matches(pattern: &str, host: &str) -> bool {
  if let Some(suffix) = pattern.strip_prefix("*.") {
    return host.eq_ignore_ascii_case(suffix)
      || (host.len() > suffix.len() + 1
        && host[..host.len() - suffix.len()].ends_with('.')
        && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix));
  }
  pattern.eq_ignore_ascii_case(host)
}
