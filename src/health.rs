use crate::upstream::Upstream;
use futures::future::join_all;
use log::{info, warn};
use std::{io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
  net::TcpStream,
  time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
  /// pause between the start of two probe passes
  pub period: Duration,
  /// upper bound for establishing a single probe connection
  pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ProbeError {
  #[error("connection failed: {0}")]
  Connect(#[from] io::Error),
  #[error("no connection within {0:?}")]
  Timeout(Duration),
}

/// Probes all members right away and then once every `config.period`, until `token` is cancelled.
///
/// The first pass always runs. Cancellation is checked after each pass and also interrupts the wait
/// between passes.
pub async fn watch_health(members: Arc<[Upstream]>, config: HealthConfig, token: CancellationToken) {
  info!(
    "health prober started for {} upstreams (period {:?}, timeout {:?})",
    members.len(),
    config.period,
    config.timeout
  );

  let mut interval_timer = time::interval(config.period);
  interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // completes immediately, so no request waits a full period for a live upstream
  interval_timer.tick().await;

  loop {
    check_health_once(&members, config.timeout).await;

    if token.is_cancelled() {
      break;
    }

    tokio::select! {
      biased;
      _ = token.cancelled() => break,
      _ = interval_timer.tick() => {}
    }
  }

  info!("health prober stopped");
}

/// Runs one probe per member concurrently. A failing member never affects the others.
pub async fn check_health_once(members: &[Upstream], timeout: Duration) {
  join_all(members.iter().map(|upstream| update_liveness(upstream, timeout))).await;
}

async fn update_liveness(upstream: &Upstream, timeout: Duration) {
  let result = probe(upstream.probe_address(), timeout).await;
  if let Err(e) = &result {
    warn!("{} unreachable: {}", upstream.probe_address(), e);
  }

  let alive = result.is_ok();
  if upstream.set_alive(alive) != alive {
    info!(
      "new liveness for {}: {}",
      upstream.address(),
      if alive { "alive" } else { "dead" }
    );
  }
}

/// Opens a bare TCP connection and closes it right away.
pub async fn probe(address: &str, timeout: Duration) -> Result<(), ProbeError> {
  match time::timeout(timeout, TcpStream::connect(address)).await {
    Ok(Ok(stream)) => {
      drop(stream);
      Ok(())
    }
    Ok(Err(e)) => Err(ProbeError::Connect(e)),
    Err(_) => Err(ProbeError::Timeout(timeout)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::forwarder::testing::{upstream, CountingForwarder};
  use tokio::net::TcpListener;

  const TIMEOUT: Duration = Duration::from_secs(1);

  async fn reachable() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
  }

  async fn unreachable() -> String {
    let (listener, address) = reachable().await;
    drop(listener);
    address
  }

  async fn wait_until<F: Fn() -> bool>(condition: F) {
    time::timeout(Duration::from_secs(5), async {
      while !condition() {
        time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("condition not reached in time");
  }

  #[tokio::test]
  async fn probe_reachable_address() {
    let (_listener, address) = reachable().await;

    assert!(probe(&address, TIMEOUT).await.is_ok());
  }

  #[tokio::test]
  async fn probe_refused_address() {
    let address = unreachable().await;

    assert!(matches!(probe(&address, TIMEOUT).await, Err(ProbeError::Connect(_))));
  }

  #[tokio::test]
  async fn check_health_once_updates_every_member() {
    let (_listener, up) = reachable().await;
    let down = unreachable().await;

    for order in [[up.as_str(), down.as_str()], [down.as_str(), up.as_str()]] {
      let members: Vec<_> = order
        .iter()
        .map(|address| upstream(address, CountingForwarder::new()))
        .collect();

      check_health_once(&members, TIMEOUT).await;

      for member in &members {
        assert_eq!(member.is_alive(), member.probe_address() == up, "{}", member.probe_address());
      }
    }
  }

  #[tokio::test]
  async fn check_health_once_marks_recovered_member_dead_again() {
    let (listener, address) = reachable().await;
    let members = vec![upstream(&address, CountingForwarder::new())];

    check_health_once(&members, TIMEOUT).await;
    assert!(members[0].is_alive());

    drop(listener);
    check_health_once(&members, TIMEOUT).await;
    assert!(!members[0].is_alive());
  }

  #[tokio::test]
  async fn watch_health_probes_immediately_and_stops_on_cancel() {
    let (_listener, address) = reachable().await;
    let members: Arc<[Upstream]> = Arc::from(vec![upstream(&address, CountingForwarder::new())]);
    let token = CancellationToken::new();
    let config = HealthConfig {
      period: Duration::from_secs(3600),
      timeout: TIMEOUT,
    };

    let handle = tokio::spawn(watch_health(members.clone(), config, token.clone()));

    wait_until(|| members[0].is_alive()).await;
    token.cancel();
    time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn watch_health_repeats_passes() {
    let (listener, address) = reachable().await;
    let members: Arc<[Upstream]> = Arc::from(vec![upstream(&address, CountingForwarder::new())]);
    let token = CancellationToken::new();
    let config = HealthConfig {
      period: Duration::from_millis(20),
      timeout: TIMEOUT,
    };

    let handle = tokio::spawn(watch_health(members.clone(), config, token.clone()));

    wait_until(|| members[0].is_alive()).await;
    drop(listener);
    wait_until(|| !members[0].is_alive()).await;

    token.cancel();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn watch_health_cancelled_before_start_still_runs_first_pass() {
    let (_listener, address) = reachable().await;
    let members: Arc<[Upstream]> = Arc::from(vec![upstream(&address, CountingForwarder::new())]);
    let token = CancellationToken::new();
    token.cancel();
    let config = HealthConfig {
      period: Duration::from_secs(1),
      timeout: TIMEOUT,
    };

    time::timeout(Duration::from_secs(5), watch_health(members.clone(), config, token))
      .await
      .unwrap();

    assert!(members[0].is_alive());
  }
}
