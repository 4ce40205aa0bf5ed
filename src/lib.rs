pub mod configuration;
pub mod error_response;
pub mod forwarder;
pub mod health;
pub mod listeners;
pub mod load_balancer;
pub mod logging;
pub mod pool;
pub mod round_robin;
pub mod server;
pub mod upstream;
