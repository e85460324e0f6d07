use clap::Parser;
use log::{error, info};
use server::config::{AuthMode, Configuration};
use server::server::Server;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; command-line flags override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to bind to (repeatable)
    #[arg(short = 'H', long = "host")]
    hosts: Vec<IpAddr>,

    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Use shared-password authentication with this password
    #[arg(long)]
    password: Option<String>,

    /// Start with traffic statistics enabled
    #[arg(long)]
    statistics: bool,

    /// Number of dispatch workers
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<Configuration, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => Configuration::load(path)?,
            None => Configuration::default(),
        };

        if !self.hosts.is_empty() {
            config.bind_addresses = self.hosts;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(password) = self.password {
            config.auth_mode = AuthMode::Password;
            config.password = password;
        }
        if self.statistics {
            config.statistics_enabled = true;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    let server = Server::bind(config).await?;
    info!("Listening on {:?}", server.local_addrs());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
