//! Wire vocabulary shared by the relay server and its clients.
//!
//! - [`channel`]: the fixed channel table and delivery methods
//! - [`messages`]: `bincode` payloads carried on each channel
//! - [`frame`]: datagram framing
//! - [`reliability`]: per-stream sequencing, acks, ordering and dedupe
//! - [`did`]: the `did:key` codec used for challenge/response authentication

pub mod channel;
pub mod did;
pub mod frame;
pub mod messages;
pub mod reliability;

pub use channel::{Channel, DeliveryMethod, CHANNEL_COUNT, MAX_CHANNELS};
pub use frame::Frame;
pub use messages::PlayerId;

/// Bumped whenever a message layout changes.
pub const PROTOCOL_VERSION: u16 = 1;
pub const DEFAULT_PORT: u16 = 4296;
/// Largest datagram either side will send.
pub const MAX_PACKET_SIZE: usize = 1200;
/// Payload bytes carried by one fragment, leaving room for the frame header.
pub const MAX_FRAGMENT_PAYLOAD: usize = 1100;
/// Largest reliable-ordered message either side will reassemble.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
/// Length of an authentication challenge nonce in bytes.
pub const NONCE_LEN: usize = 32;
