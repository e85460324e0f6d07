//! # Relay Client Library
//!
//! A small client for the relay server, used by the load bot and the
//! integration tests.
//!
//! ## Connection
//! [`network::RelayClient::connect`] sends the connect request, retries it
//! until the server accepts, answers the DID challenge when one arrives and
//! returns once the server has admitted the player. Password credentials skip
//! the challenge.
//!
//! ## Delivery
//! The client runs the same per-stream reliability as the server: reliable
//! frames are acked and resent, ordered streams are reassembled, sequenced
//! streams drop stale frames. Unreliable sends are tunnelled through the fall
//! channel and unwrapped again on receipt, so callers always see the real
//! channel.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Credentials, RelayClient};
//! use ed25519_dalek::SigningKey;
//! use rand::rngs::OsRng;
//! use shared::messages::ReadyMessage;
//! use shared::{Channel, DeliveryMethod};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = SigningKey::generate(&mut OsRng);
//!     let server = "127.0.0.1:4296".parse()?;
//!     let mut client =
//!         RelayClient::connect(server, Credentials::Did(key), ReadyMessage::default()).await?;
//!
//!     client
//!         .send(Channel::PlayerAvatar, DeliveryMethod::Sequenced, &[0u8; 32])
//!         .await?;
//!     while let Some(message) = client.recv(Duration::from_millis(100)).await? {
//!         println!("channel {}: {} bytes", message.channel, message.payload.len());
//!     }
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
