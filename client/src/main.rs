use clap::Parser;
use client::network::{Credentials, RelayClient};
use ed25519_dalek::SigningKey;
use log::info;
use rand::rngs::OsRng;
use rand::RngCore;
use shared::messages::{MetaDataMessage, ReadyMessage};
use shared::{Channel, DeliveryMethod};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:4296")]
    server: SocketAddr,

    /// Display name sent with the join request
    #[arg(short = 'n', long, default_value = "bot")]
    name: String,

    /// Authenticate with this password instead of a fresh did:key
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// How long to stay connected, in seconds
    #[arg(short = 'd', long, default_value = "10")]
    duration: u64,

    /// Movement updates per second
    #[arg(short = 'r', long, default_value = "30")]
    rate: u32,

    /// Size of each synthetic movement update in bytes
    #[arg(long, default_value = "48")]
    movement_size: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let credentials = match &args.password {
        Some(password) => Credentials::Password {
            identity: args.name.clone(),
            password: password.clone(),
        },
        None => Credentials::Did(SigningKey::generate(&mut OsRng)),
    };
    let ready = ReadyMessage {
        meta: MetaDataMessage {
            display_name: args.name.clone(),
            player_uuid: String::new(),
        },
        ..ReadyMessage::default()
    };

    let mut client = RelayClient::connect(args.server, credentials, ready).await?;

    let tick = Duration::from_secs_f64(1.0 / args.rate.max(1) as f64);
    let end = Instant::now() + Duration::from_secs(args.duration);
    let mut movement = vec![0u8; args.movement_size.max(1)];
    let mut received: BTreeMap<u8, (u64, u64)> = BTreeMap::new();
    let mut sent = 0u64;

    while Instant::now() < end {
        OsRng.fill_bytes(&mut movement);
        client
            .send(Channel::PlayerAvatar, DeliveryMethod::Sequenced, &movement)
            .await?;
        sent += 1;

        let next_tick = Instant::now() + tick;
        while let Some(message) = client
            .recv(next_tick.saturating_duration_since(Instant::now()))
            .await?
        {
            let entry = received.entry(message.channel).or_default();
            entry.0 += 1;
            entry.1 += message.payload.len() as u64;
        }
    }

    info!("Player {} sent {} movement updates", client.player_id(), sent);
    for (channel, (messages, bytes)) in &received {
        let name = Channel::from_id(*channel)
            .map(|channel| channel.to_string())
            .unwrap_or_else(|| channel.to_string());
        info!("Received {} messages ({} bytes) on {}", messages, bytes, name);
    }

    client.disconnect().await?;
    Ok(())
}
