use crate::{
  configuration::Config,
  listeners::HyperAcceptor,
  pool::{PoolError, UpstreamPool},
  server,
};
use log::{info, warn};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum LoadBalancerError {
  #[error(transparent)]
  Pool(#[from] PoolError),
  #[error("failed to bind listener on {address}: {source}")]
  Bind {
    address: SocketAddr,
    #[source]
    source: io::Error,
  },
  #[error("listener failed: {0}")]
  Listener(Arc<io::Error>),
  #[error("load balancer is already running")]
  AlreadyRunning,
  #[error("load balancer was stopped and cannot be started again")]
  AlreadyStopped,
}

#[derive(Debug, Clone)]
enum ListenerState {
  Idle,
  Starting,
  Serving(SocketAddr),
  Closed(Result<(), Arc<io::Error>>),
}

/// An HTTP listener in front of an [UpstreamPool].
#[derive(Debug)]
pub struct LoadBalancer {
  address: SocketAddr,
  pool: Arc<UpstreamPool>,
  drain_timeout: Duration,
  shutdown: CancellationToken,
  abort: CancellationToken,
  state: watch::Sender<ListenerState>,
}

impl LoadBalancer {
  pub fn new(config: &Config) -> Result<LoadBalancer, LoadBalancerError> {
    let pool = UpstreamPool::new(&config.upstreams, config.health_config())?;
    Ok(LoadBalancer::with_pool(config.listen_address(), pool).with_drain_timeout(config.shutdown_timeout()))
  }

  pub fn with_pool(address: SocketAddr, pool: UpstreamPool) -> LoadBalancer {
    let (state, _) = watch::channel(ListenerState::Idle);
    LoadBalancer {
      address,
      pool: Arc::new(pool),
      drain_timeout: DEFAULT_DRAIN_TIMEOUT,
      shutdown: CancellationToken::new(),
      abort: CancellationToken::new(),
      state,
    }
  }

  /// Sets how long [LoadBalancer::stop] waits for in-flight requests before dropping them.
  pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> LoadBalancer {
    self.drain_timeout = drain_timeout;
    self
  }

  pub fn pool(&self) -> &UpstreamPool {
    &self.pool
  }

  /// The address the listener is actually bound to, once it is serving.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    match *self.state.borrow() {
      ListenerState::Serving(address) => Some(address),
      _ => None,
    }
  }

  /// Starts the health prober, then serves requests until [LoadBalancer::stop] is called or the
  /// listener fails.
  pub async fn start(&self) -> Result<(), LoadBalancerError> {
    if self.shutdown.is_cancelled() || self.pool.is_stopped() {
      return Err(LoadBalancerError::AlreadyStopped);
    }
    let claimed = self.state.send_if_modified(|state| match state {
      ListenerState::Idle => {
        *state = ListenerState::Starting;
        true
      }
      _ => false,
    });
    if !claimed {
      return Err(LoadBalancerError::AlreadyRunning);
    }
    let _closed_on_drop = CloseOnDrop(&self.state);

    let acceptor = match HyperAcceptor::bind(self.address).await {
      Ok(acceptor) => acceptor,
      Err(source) => {
        self.state.send_replace(ListenerState::Idle);
        return Err(LoadBalancerError::Bind {
          address: self.address,
          source,
        });
      }
    };
    self.state.send_replace(ListenerState::Serving(acceptor.local_addr()));

    info!("balancing over {} upstreams", self.pool.members().len());
    self.pool.start();

    let shutdown = self.shutdown.clone();
    let result = server::create(
      acceptor,
      self.pool.clone(),
      async move { shutdown.cancelled().await },
      self.abort.clone(),
    )
    .await
    .map_err(Arc::new);
    info!("listener closed");

    self.state.send_replace(ListenerState::Closed(result.clone()));
    result.map_err(LoadBalancerError::Listener)
  }

  /// Closes the listener, waits until in-flight requests are answered and then stops the pool and
  /// its health prober. Requests still running after the drain timeout are dropped. Returns the
  /// listener's outcome. Safe to call more than once.
  pub async fn stop(&self) -> Result<(), LoadBalancerError> {
    self.shutdown.cancel();
    let result = match time::timeout(self.drain_timeout, self.wait_closed()).await {
      Ok(result) => result,
      Err(_) => {
        warn!(
          "requests still in flight after {:?}, dropping their connections",
          self.drain_timeout
        );
        self.abort.cancel();
        self.wait_closed().await
      }
    };

    info!(
      "stopping with {} of {} upstreams alive",
      self.pool.healthy_count(),
      self.pool.members().len()
    );
    self.pool.stop();
    self.pool.wait_stopped().await;
    result
  }

  async fn wait_closed(&self) -> Result<(), LoadBalancerError> {
    let mut state = self.state.subscribe();
    loop {
      let outcome = match &*state.borrow_and_update() {
        ListenerState::Idle => Some(Ok(())),
        ListenerState::Starting | ListenerState::Serving(_) => None,
        ListenerState::Closed(result) => Some(result.clone().map_err(LoadBalancerError::Listener)),
      };
      if let Some(outcome) = outcome {
        return outcome;
      }
      if state.changed().await.is_err() {
        return Ok(());
      }
    }
  }
}

impl Drop for LoadBalancer {
  fn drop(&mut self) {
    self.shutdown.cancel();
    self.abort.cancel();
  }
}

// marks the listener closed when `start` is dropped while serving
struct CloseOnDrop<'a>(&'a watch::Sender<ListenerState>);

impl Drop for CloseOnDrop<'_> {
  fn drop(&mut self) {
    self.0.send_if_modified(|state| match state {
      ListenerState::Starting | ListenerState::Serving(_) => {
        *state = ListenerState::Closed(Ok(()));
        true
      }
      _ => false,
    });
  }
}
