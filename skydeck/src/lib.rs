//! Telemetry and rendering core for a flight-simulator control surface.
//!
//! - [`link`]: the UDP data-reference protocol: subscriptions, value
//!   dispatch, commands and the liveness check that resubscribes after a
//!   simulator restart.
//! - [`render`]: frame-paced render tasks feeding one serialized draw
//!   worker.
//! - [`bridge`]: pages of instruments and bindings driven by a single event
//!   loop.

pub mod bridge;
pub mod link;
pub mod net;
pub mod render;
pub mod runtime;
pub mod trace;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgeEvent, BridgeHandle, BridgeThread};
pub use link::{Frequency, LinkConfig, LinkError, SubscriptionIndex, TelemetryLink};
pub use net::{Endpoint, Transport};
pub use render::{
    Readings, RenderError, RenderScheduler, Renderer, SurfaceId, ValueCell, format_value,
};
pub use runtime::timing::{Clock, ManualClock, MonoInstant, SystemClock};

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
