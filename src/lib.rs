//! droplink: peer-to-peer file drop over a short-lived rendezvous relay.
//!
//! Two endpoints discover each other through a relay holding a 16-hex
//! session token, negotiate a direct peer link (offer/answer/ICE relayed
//! by the session bus), then stream files over an ordered, reliable data
//! channel with flow-controlled chunking.

pub mod context;
pub mod error;
pub mod link;
pub mod receiver;
pub mod relay;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod status;
pub mod token;
pub mod transfer;
pub mod webrtc_peer;

pub use error::{Error, Result};
