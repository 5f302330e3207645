//! Timing primitives: monotonic instants, injectable clocks and the timer
//! wheel that drives render ticks.

mod slab;
mod time;
mod wheel;

pub use time::{Clock, ManualClock, MonoInstant, SystemClock, duration_millis};
pub use wheel::{TimerHandle, TimerWheel, WheelError};
