//! A throwaway upstream for trying the balancer locally:
//!
//! ```sh
//! toy_backend --id 1 &
//! toy_backend --id 2 &
//! toy_backend --id 3 &
//! ```
use clap::{Arg, Command};
use golb::logging;
use hyper::{
  service::{make_service_fn, service_fn},
  Body, Method, Request, Response, Server, StatusCode,
};
use log::{debug, info};
use std::{convert::Infallible, error::Error, net::SocketAddr};

const MAX_ID: u16 = 9;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
  let matches = Command::new("toy_backend")
    .about("answers every GET with its id")
    .arg(
      Arg::new("id")
        .long("id")
        .value_name("ID")
        .help("server id, between 0 and 9; the server listens on port 808<ID>")
        .takes_value(true)
        .default_value("0"),
    )
    .get_matches();

  let id: u16 = matches.value_of_t("id")?;
  if id > MAX_ID {
    return Err(format!("provided server id {} out of bounds", id).into());
  }
  let _handle = logging::initialize()?;

  let address = SocketAddr::from(([0, 0, 0, 0], 8080 + id));
  let make_service = make_service_fn(move |_| async move {
    Ok::<_, Infallible>(service_fn(move |request: Request<Body>| async move {
      Ok::<_, Infallible>(respond(id, &request))
    }))
  });

  info!("server {} listening at {}", id, address);
  Server::try_bind(&address)?.serve(make_service).await?;
  Ok(())
}

fn respond(id: u16, request: &Request<Body>) -> Response<Body> {
  debug!("server {}: {} {}", id, request.method(), request.uri());
  if request.method() == Method::GET {
    Response::new(Body::from(format!("server {}: ok", id)))
  } else {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
    response
  }
}
