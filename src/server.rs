use crate::{
  forwarder::ClientAddress,
  listeners::{HyperAcceptor, RemoteAddress},
  pool::UpstreamPool,
};
use futures::{Future, TryFutureExt};
use hyper::{
  service::{make_service_fn, Service},
  Body, Request, Response, Server,
};
use log::{debug, warn};
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Serves every accepted connection by dispatching its requests to `pool`, until `shutdown`
/// resolves. In-flight requests are completed before this returns, unless `abort` is cancelled
/// first: then every connection is dropped and this returns right away.
pub async fn create<F>(
  acceptor: HyperAcceptor,
  pool: Arc<UpstreamPool>,
  shutdown: F,
  abort: CancellationToken,
) -> Result<(), io::Error>
where
  F: Future<Output = ()>,
{
  let service = make_service_fn(move |stream: &TcpStream| {
    let client_address = stream.remote_addr().ok();
    let pool = pool.clone();

    async move { Ok::<_, io::Error>(MainService { client_address, pool }) }
  });
  let server = Server::builder(acceptor)
    .executor(AbortableExecutor { abort: abort.clone() })
    .serve(service)
    .with_graceful_shutdown(shutdown)
    .map_err(|e| {
      let msg = format!("Failed to listen server: {}", e);
      io::Error::new(io::ErrorKind::Other, msg)
    });

  tokio::select! {
    result = server => result,
    _ = abort.cancelled() => {
      warn!("listener closed with requests still in flight");
      Ok(())
    }
  }
}

/// Spawns connection tasks on tokio, each one dropped as soon as `abort` is cancelled.
#[derive(Clone)]
struct AbortableExecutor {
  abort: CancellationToken,
}

impl<F> hyper::rt::Executor<F> for AbortableExecutor
where
  F: Future + Send + 'static,
  F::Output: Send + 'static,
{
  fn execute(&self, connection: F) {
    let abort = self.abort.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = connection => {}
        _ = abort.cancelled() => {}
      }
    });
  }
}

pub struct MainService {
  client_address: Option<SocketAddr>,
  pool: Arc<UpstreamPool>,
}

impl Service<Request<Body>> for MainService {
  type Response = Response<Body>;
  type Error = hyper::Error;

  // let's allow this complex type. A refactor would make it more complicated due to the used trait types
  #[allow(clippy::type_complexity)]
  type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

  fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
    Poll::Ready(Ok(()))
  }

  fn call(&mut self, mut request: Request<Body>) -> Self::Future {
    debug!("{:#?} {} {}", request.version(), request.method(), request.uri());

    if let Some(client_address) = self.client_address {
      request.extensions_mut().insert(ClientAddress(client_address));
    }
    let pool = self.pool.clone();

    Box::pin(async move { Ok(pool.dispatch(request).await) })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    forwarder::testing::{upstream, CountingForwarder},
    health::HealthConfig,
  };
  use hyper::StatusCode;
  use std::time::Duration;

  fn generate_test_service(alive: bool) -> (MainService, CountingForwarder) {
    let forwarder = CountingForwarder::new();
    let member = upstream("127.0.0.1:8084", forwarder.clone());
    member.set_alive(alive);
    let pool = UpstreamPool::from_members(
      vec![member],
      HealthConfig {
        period: Duration::from_secs(60),
        timeout: Duration::from_millis(500),
      },
    )
    .unwrap();

    let service = MainService {
      client_address: Some("127.0.0.1:3000".parse().unwrap()),
      pool: Arc::new(pool),
    };
    (service, forwarder)
  }

  #[tokio::test]
  async fn call_dispatches_to_alive_upstream() {
    let (mut service, forwarder) = generate_test_service(true);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = service.call(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(forwarder.calls(), 1);
  }

  #[tokio::test]
  async fn call_without_alive_upstream_is_unavailable() {
    let (mut service, forwarder) = generate_test_service(false);
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = service.call(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(forwarder.calls(), 0);
  }
}
