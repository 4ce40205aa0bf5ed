use crate::{forwarder::Forwarder, pool::PoolError};
use hyper::{http::uri::Uri, Body, Request, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

const DEFAULT_HTTP_PORT: u16 = 80;

/// A single backend target.
///
/// `alive` has one writer (the health prober) and many readers (dispatch). Writes use `Release`
/// and reads use `Acquire`, so a dispatch that observes a flag also observes everything the prober
/// did before storing it. No lock is involved.
#[derive(Debug)]
pub struct Upstream {
  address: Uri,
  probe_address: String,
  alive: AtomicBool,
  forwarder: Box<dyn Forwarder>,
}

impl Upstream {
  /// Creates an upstream which is considered dead until its first successful probe.
  pub fn new(target: UpstreamAddress, forwarder: Box<dyn Forwarder>) -> Upstream {
    Upstream {
      address: target.uri,
      probe_address: target.probe_address,
      alive: AtomicBool::new(false),
      forwarder,
    }
  }

  pub fn address(&self) -> &Uri {
    &self.address
  }

  /// `host:port` dialed by the health prober
  pub fn probe_address(&self) -> &str {
    &self.probe_address
  }

  pub fn is_alive(&self) -> bool {
    self.alive.load(Ordering::Acquire)
  }

  /// Stores the new liveness and returns the previous one.
  pub fn set_alive(&self, alive: bool) -> bool {
    self.alive.swap(alive, Ordering::AcqRel)
  }

  pub async fn forward(&self, request: Request<Body>) -> Response<Body> {
    self.forwarder.forward(request).await
  }
}

/// A validated upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddress {
  pub uri: Uri,
  pub probe_address: String,
}

impl UpstreamAddress {
  /// Accepts `http://host[:port][/prefix]` or a bare `host:port`, which is read as plain http.
  pub fn parse(raw: &str) -> Result<UpstreamAddress, PoolError> {
    let invalid = |reason: String| PoolError::InvalidAddress {
      address: raw.to_string(),
      reason,
    };

    let candidate = if raw.contains("://") {
      raw.to_string()
    } else {
      format!("http://{}", raw)
    };
    let url = Url::parse(&candidate).map_err(|e| invalid(e.to_string()))?;

    if url.scheme() != "http" {
      return Err(PoolError::UnsupportedScheme {
        address: raw.to_string(),
        scheme: url.scheme().to_string(),
      });
    }
    let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
    let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
    let probe_address = format!("{}:{}", host, port);
    let uri = url.as_str().parse::<Uri>().map_err(|e| invalid(e.to_string()))?;

    Ok(UpstreamAddress { uri, probe_address })
  }
}
