use hyper::{Body, Response, StatusCode};
use log::error;
use std::error::Error;

pub fn service_unavailable() -> Response<Body> {
  with_status(StatusCode::SERVICE_UNAVAILABLE, Body::from("server not available"))
}

pub fn handle_bad_gateway<E: Error>(error: E) -> Response<Body> {
  log_error(error);
  bad_gateway()
}

pub fn bad_gateway() -> Response<Body> {
  with_status(StatusCode::BAD_GATEWAY, Body::empty())
}

pub fn log_error<E: Error>(error: E) {
  error!("{}", error);
}

fn with_status(status: StatusCode, body: Body) -> Response<Body> {
  let mut response = Response::new(body);
  *response.status_mut() = status;
  response
}
