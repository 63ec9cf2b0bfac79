//! Upstream Adapters
//!
//! The market gateway client, vendor record normalizers, and the bridge
//! that ties them to the engine's subscription lifecycle.

mod backoff;
mod bridge;
mod gateway;
pub mod normalize;

pub use backoff::{Backoff, BackoffConfig};
pub use bridge::{UpstreamBridge, UpstreamState};
pub use gateway::{ConnectionState, FeedState, FrameError, GatewayClient, decode_frame};
