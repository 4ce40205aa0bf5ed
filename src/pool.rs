use crate::{
  error_response::service_unavailable,
  forwarder::HttpForwarder,
  health::{watch_health, HealthConfig},
  round_robin::RoundRobin,
  upstream::{Upstream, UpstreamAddress},
};
use hyper::{Body, Client, Request, Response};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
  #[error("no upstream addresses configured")]
  NoUpstreams,
  #[error("failed to parse upstream address {address:?}: {reason}")]
  InvalidAddress { address: String, reason: String },
  #[error("unsupported scheme {scheme:?} in upstream address {address:?}, only http is supported")]
  UnsupportedScheme { address: String, scheme: String },
  #[error("health check period must be greater than zero")]
  ZeroHealthCheckPeriod,
}

/// A fixed set of upstreams, the round-robin cursor and the health prober that keeps their
/// liveness current.
///
/// Dropping the pool cancels the prober.
#[derive(Debug)]
pub struct UpstreamPool {
  members: Arc<[Upstream]>,
  selector: RoundRobin,
  health_config: HealthConfig,
  token: CancellationToken,
  prober: Mutex<Option<JoinHandle<()>>>,
}

impl UpstreamPool {
  /// Builds one http forwarder per address. Every address is validated up front, a single invalid
  /// one fails the whole pool.
  pub fn new<S: AsRef<str>>(addresses: &[S], health_config: HealthConfig) -> Result<UpstreamPool, PoolError> {
    let client: Client<_, Body> = Client::new();
    let members = addresses
      .iter()
      .map(|address| {
        let target = UpstreamAddress::parse(address.as_ref())?;
        let forwarder = HttpForwarder::new(target.uri.clone(), client.clone());
        Ok(Upstream::new(target, Box::new(forwarder)))
      })
      .collect::<Result<Vec<_>, PoolError>>()?;

    UpstreamPool::from_members(members, health_config)
  }

  pub fn from_members(members: Vec<Upstream>, health_config: HealthConfig) -> Result<UpstreamPool, PoolError> {
    if members.is_empty() {
      return Err(PoolError::NoUpstreams);
    }
    if health_config.period.is_zero() {
      return Err(PoolError::ZeroHealthCheckPeriod);
    }

    Ok(UpstreamPool {
      members: Arc::from(members),
      selector: RoundRobin::new(),
      health_config,
      token: CancellationToken::new(),
      prober: Mutex::new(None),
    })
  }

  pub fn members(&self) -> &[Upstream] {
    &self.members
  }

  pub fn healthy_count(&self) -> usize {
    self.members.iter().filter(|upstream| upstream.is_alive()).count()
  }

  pub fn next(&self) -> Option<&Upstream> {
    self.selector.next(&self.members)
  }

  /// Forwards the request to the next alive upstream, or answers 503 without contacting anyone.
  pub async fn dispatch(&self, request: Request<Body>) -> Response<Body> {
    match self.next() {
      Some(upstream) => {
        debug!("dispatching {} {} to {}", request.method(), request.uri(), upstream.address());
        upstream.forward(request).await
      }
      None => {
        warn!("no alive upstream for {} {}", request.method(), request.uri());
        service_unavailable()
      }
    }
  }

  /// Spawns the health prober onto the current tokio runtime and returns immediately.
  pub fn start(&self) {
    if self.token.is_cancelled() {
      warn!("upstream pool was stopped, the health prober is not restarted");
      return;
    }

    let mut prober = self.lock_prober();
    if prober.is_some() {
      debug!("health prober is already running");
      return;
    }
    *prober = Some(tokio::spawn(watch_health(
      self.members.clone(),
      self.health_config,
      self.token.clone(),
    )));
  }

  /// Signals the prober to stop. Calling it again has no further effect.
  pub fn stop(&self) {
    if !self.token.is_cancelled() {
      info!("stopping upstream pool");
      self.token.cancel();
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Waits until the prober task has finished. Returns right away if it was never started.
  pub async fn wait_stopped(&self) {
    let handle = self.lock_prober().take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        error!("health prober terminated abnormally: {}", e);
      }
    }
  }

  fn lock_prober(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    self.prober.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for UpstreamPool {
  fn drop(&mut self) {
    self.token.cancel();
  }
}
