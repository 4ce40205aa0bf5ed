use crate::error_response::handle_bad_gateway;
use async_trait::async_trait;
use hyper::{
  client::HttpConnector,
  header::{HeaderName, HeaderValue, CONNECTION},
  http::{self, uri::Uri},
  Body, Client, HeaderMap, Request, Response, Version,
};
use log::debug;
use std::net::SocketAddr;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

// Headers that only apply to a single transport hop and must not be relayed.
const HOP_HEADERS: [&str; 9] = [
  "connection",
  "keep-alive",
  "proxy-connection",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Peer address of the inbound connection. The server attaches it to every request as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddress(pub SocketAddr);

/// Proxies a request to one fixed upstream and relays its response.
///
/// Implementations never fail: transport errors are turned into an error response.
#[async_trait]
pub trait Forwarder: Send + Sync + std::fmt::Debug {
  async fn forward(&self, request: Request<Body>) -> Response<Body>;
}

#[derive(Debug, Clone)]
pub struct HttpForwarder {
  target: Uri,
  client: Client<HttpConnector, Body>,
}

impl HttpForwarder {
  pub fn new(target: Uri, client: Client<HttpConnector, Body>) -> HttpForwarder {
    HttpForwarder { target, client }
  }
}

#[async_trait]
impl Forwarder for HttpForwarder {
  async fn forward(&self, request: Request<Body>) -> Response<Body> {
    let request = match backend_request(request, &self.target) {
      Ok(request) => request,
      Err(e) => return handle_bad_gateway(e),
    };
    debug!("forwarding {} {}", request.method(), request.uri());

    match self.client.request(request).await {
      Ok(mut response) => {
        remove_hop_headers(response.headers_mut());
        response
      }
      Err(e) => handle_bad_gateway(e),
    }
  }
}

fn backend_request(request: Request<Body>, target: &Uri) -> Result<Request<Body>, http::Error> {
  let (mut parts, body) = request.into_parts();
  parts.uri = backend_uri(target, &parts.uri)?;
  // the client speaks HTTP/1.1 to upstreams regardless of the inbound version
  parts.version = Version::HTTP_11;
  remove_hop_headers(&mut parts.headers);
  if let Some(ClientAddress(address)) = parts.extensions.get::<ClientAddress>() {
    append_forwarded_for(&mut parts.headers, address);
  }
  Ok(Request::from_parts(parts, body))
}

fn backend_uri(target: &Uri, request_uri: &Uri) -> Result<Uri, http::Error> {
  let path = join_paths(target.path(), request_uri.path());
  let path_and_query = match (target.query(), request_uri.query()) {
    (Some(target_query), Some(request_query)) => format!("{}?{}&{}", path, target_query, request_query),
    (Some(query), None) | (None, Some(query)) => format!("{}?{}", path, query),
    (None, None) => path,
  };

  let mut builder = Uri::builder().path_and_query(path_and_query);
  if let Some(scheme) = target.scheme() {
    builder = builder.scheme(scheme.clone());
  }
  if let Some(authority) = target.authority() {
    builder = builder.authority(authority.clone());
  }
  builder.build()
}

/// Joins both paths with exactly one slash between them.
fn join_paths(prefix: &str, path: &str) -> String {
  match (prefix.ends_with('/'), path.starts_with('/')) {
    (true, true) => format!("{}{}", prefix, &path[1..]),
    (false, false) => format!("{}/{}", prefix, path),
    _ => format!("{}{}", prefix, path),
  }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
  let listed: Vec<HeaderName> = headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|value| value.to_str().ok())
    .flat_map(|value| value.split(','))
    .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
    .collect();

  for name in listed {
    headers.remove(name);
  }
  for name in HOP_HEADERS {
    headers.remove(name);
  }
}

fn append_forwarded_for(headers: &mut HeaderMap, address: &SocketAddr) {
  let ip = address.ip().to_string();
  let value = match headers.get(X_FORWARDED_FOR).and_then(|prior| prior.to_str().ok()) {
    Some(prior) => format!("{}, {}", prior, ip),
    None => ip,
  };
  if let Ok(value) = HeaderValue::from_str(&value) {
    headers.insert(X_FORWARDED_FOR, value);
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use hyper::{header::HOST, Method, StatusCode};

  #[test]
  fn join_paths_uses_single_slash() {
    assert_eq!(join_paths("/", "/users"), "/users");
    assert_eq!(join_paths("/api", "/users"), "/api/users");
    assert_eq!(join_paths("/api/", "/users"), "/api/users");
    assert_eq!(join_paths("/api", "users"), "/api/users");
    assert_eq!(join_paths("", "/users"), "/users");
  }

  #[test]
  fn backend_uri_replaces_scheme_and_authority() {
    let target: Uri = "http://127.0.0.1:8081".parse().unwrap();
    let request_uri: Uri = "/status?verbose=1".parse().unwrap();

    let uri = backend_uri(&target, &request_uri).unwrap();

    assert_eq!(uri.to_string(), "http://127.0.0.1:8081/status?verbose=1");
  }

  #[test]
  fn backend_uri_keeps_target_prefix_and_query() {
    let target: Uri = "http://10.0.0.1/base?token=a".parse().unwrap();
    let request_uri: Uri = "/items?page=2".parse().unwrap();

    let uri = backend_uri(&target, &request_uri).unwrap();

    assert_eq!(uri.to_string(), "http://10.0.0.1/base/items?token=a&page=2");
  }

  #[test]
  fn hop_headers_are_removed() {
    let mut headers = HeaderMap::new();
    headers.insert(CONNECTION, "keep-alive, x-session".parse().unwrap());
    headers.insert("keep-alive", "timeout=5".parse().unwrap());
    headers.insert("x-session", "abc".parse().unwrap());
    headers.insert("upgrade", "websocket".parse().unwrap());
    headers.insert("accept", "text/plain".parse().unwrap());

    remove_hop_headers(&mut headers);

    assert_eq!(headers.len(), 1);
    assert_eq!(headers.get("accept").unwrap(), "text/plain");
  }

  #[test]
  fn forwarded_for_is_appended() {
    let mut headers = HeaderMap::new();
    append_forwarded_for(&mut headers, &"10.0.0.7:5000".parse().unwrap());
    assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7");

    append_forwarded_for(&mut headers, &"10.0.0.8:5000".parse().unwrap());
    assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.0.0.7, 10.0.0.8");
  }

  #[test]
  fn backend_request_preserves_method_and_host() {
    let mut request = Request::builder()
      .method(Method::POST)
      .uri("/submit")
      .header(HOST, "balancer.localhost")
      .header("transfer-encoding", "chunked")
      .body(Body::from("payload"))
      .unwrap();
    request
      .extensions_mut()
      .insert(ClientAddress("192.168.1.4:41000".parse().unwrap()));
    let target: Uri = "http://127.0.0.1:8082".parse().unwrap();

    let request = backend_request(request, &target).unwrap();

    assert_eq!(request.method(), Method::POST);
    assert_eq!(request.uri().to_string(), "http://127.0.0.1:8082/submit");
    assert_eq!(request.headers().get(HOST).unwrap(), "balancer.localhost");
    assert_eq!(request.headers().get(X_FORWARDED_FOR).unwrap(), "192.168.1.4");
    assert!(request.headers().get("transfer-encoding").is_none());
  }

  #[tokio::test]
  async fn unreachable_upstream_answers_bad_gateway() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let target: Uri = format!("http://{}", address).parse().unwrap();
    let forwarder = HttpForwarder::new(target, Client::new());
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = forwarder.forward(request).await;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  }
}
