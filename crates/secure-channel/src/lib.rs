//! Authenticated encryption for point-to-point exchanges between peers
//!
//! Messages are sealed with AES-256-GCM under a pre-shared [`SessionKey`],
//! stamped with their creation time and a random nonce, and rejected on
//! receipt when they fall outside the replay window or repeat a nonce.

pub mod channel;
pub mod error;
pub mod message;

pub use channel::{SecureChannel, SECURE_MESSAGE_CHARACTERISTIC_UUID};
pub use error::{SecureChannelError, SecureChannelResult};
pub use message::{open, seal, SecureMessage, SessionKey};
