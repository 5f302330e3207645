//! Runtime scaffolding shared by the link and the render scheduler.
//!
//! - `timing`: clocks, millisecond instants and the hashed timer wheel.

pub mod timing;
