use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use log::{info, warn};
use std::{
  io,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
  time::Duration,
};
use tokio::{
  net::{TcpListener, TcpStream},
  time,
};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Adapts a bound [TcpListener] to hyper's `Accept` trait.
pub struct HyperAcceptor {
  local_addr: SocketAddr,
  acceptor: Pin<Box<dyn Stream<Item = Result<TcpStream, io::Error>> + Send>>,
}

impl HyperAcceptor {
  pub async fn bind(address: SocketAddr) -> Result<HyperAcceptor, io::Error> {
    let listener = TcpListener::bind(address).await?;
    let local_addr = listener.local_addr()?;
    info!("listening on {}", local_addr);

    Ok(HyperAcceptor {
      local_addr,
      acceptor: Box::pin(incoming(listener)),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }
}

#[async_trait]
trait AcceptConnection: Send + Sync + 'static {
  async fn accept_connection(&self) -> io::Result<TcpStream>;
}

#[async_trait]
impl AcceptConnection for TcpListener {
  async fn accept_connection(&self) -> io::Result<TcpStream> {
    self.accept().await.map(|(socket, _)| socket)
  }
}

// Accept errors (fd exhaustion, aborted handshakes) are logged and retried with a growing pause, so
// the stream only ends when it is dropped.
fn incoming<L: AcceptConnection>(listener: L) -> impl Stream<Item = Result<TcpStream, io::Error>> {
  stream! {
    let mut backoff = MIN_ACCEPT_BACKOFF;
    loop {
      match listener.accept_connection().await {
        Ok(socket) => {
          backoff = MIN_ACCEPT_BACKOFF;
          yield Ok(socket);
        }
        Err(e) => {
          warn!("failed to accept connection, retrying in {:?}: {}", backoff, e);
          time::sleep(backoff).await;
          backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
        }
      }
    }
  }
}

impl hyper::server::accept::Accept for HyperAcceptor {
  type Conn = TcpStream;
  type Error = io::Error;

  fn poll_accept(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Result<Self::Conn, Self::Error>>> {
    Pin::new(&mut self.acceptor).poll_next(cx)
  }
}

pub trait RemoteAddress {
  fn remote_addr(&self) -> io::Result<SocketAddr>;
}

impl RemoteAddress for TcpStream {
  fn remote_addr(&self) -> io::Result<SocketAddr> {
    self.peer_addr()
  }
}
