use clap::{Arg, Command};
use golb::{configuration::Config, load_balancer::LoadBalancer, logging};
use log::{error, info};
use std::{error::Error, process, sync::Arc};

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn Error>> {
  let matches = Command::new("golb")
    .about("tiny round-robin load balancer")
    .arg(
      Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("path to the configuration file")
        .takes_value(true)
        .default_value("config.toml"),
    )
    .get_matches();

  let _handle = logging::initialize()?;

  let config_path = matches.value_of("config").unwrap_or("config.toml");
  let config = Config::from_file(config_path)?;
  let balancer = Arc::new(LoadBalancer::new(&config)?);

  let signal_balancer = balancer.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_err() {
      return;
    }
    info!("received interrupt, shutting down (interrupt again to exit immediately)");
    tokio::spawn(async move {
      if let Err(e) = signal_balancer.stop().await {
        error!("failed to close listener: {}", e);
      }
    });

    if tokio::signal::ctrl_c().await.is_ok() {
      error!("received second interrupt, exiting without draining requests");
      process::exit(130);
    }
  });

  balancer.start().await?;
  balancer.stop().await?;
  Ok(())
}
