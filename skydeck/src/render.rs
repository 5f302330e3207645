//! Frame-paced rendering against a single output device.
//!
//! Telemetry flows in through [`ValueCell`]s written by subscription
//! handlers. Each render task snapshots its cells into [`Readings`] on every
//! tick and enqueues a draw job; the [`DrawQueue`](queue::DrawQueue) worker
//! owns the [`Renderer`] and runs jobs one at a time, in enqueue order.
//! Input feedback (a held key, a just-turned knob) reaches draw callbacks the
//! same way, through a [`FeedbackCell`] copied into each snapshot.

pub mod pacing;
pub mod queue;
pub mod scheduler;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pacing::FramePacer;
pub use queue::{DrawQueue, QueueCounters};
pub use scheduler::{
    RenderScheduler, RenderTaskId, SchedulerConfig, SchedulerError, StopHandle, TaskSpec,
    TaskState,
};

/// Identifies one output surface (a display key or screen region).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(u16);

impl SurfaceId {
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Errors from the output device.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("unknown {0}")]
    UnknownSurface(SurfaceId),
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The output device. Owned by the draw worker thread.
pub trait Renderer: Send + 'static {
    /// What a draw callback paints into (a canvas, a text buffer...).
    type Context: 'static;

    /// Prepares `surface`, lets `paint` fill the context and pushes the
    /// result to the device.
    ///
    /// # Errors
    ///
    /// Device failures. The draw queue logs them and moves on.
    fn draw(
        &mut self,
        surface: SurfaceId,
        paint: &mut dyn FnMut(&mut Self::Context),
    ) -> Result<(), RenderError>;

    /// Releases the device. Called once when the draw queue shuts down.
    ///
    /// # Errors
    ///
    /// Device failures, logged by the caller.
    fn close(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Draw callback: paints a snapshot of readings into the renderer context.
pub type DrawFn<C> = Arc<dyn Fn(&Readings, &mut C) + Send + Sync>;

const PRESENT: u64 = 1 << 32;

/// Latest value of one telemetry stream, shared between the subscription
/// handler (writer) and render tasks (readers).
///
/// The value bits and the "present" flag share one atomic word, so a reader
/// never sees a torn update.
#[derive(Debug, Clone, Default)]
pub struct ValueCell {
    word: Arc<AtomicU64>,
}

impl ValueCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, value: f32) {
        self.word
            .store(PRESENT | u64::from(value.to_bits()), Ordering::Release);
    }

    /// `None` until the first store.
    #[must_use]
    pub fn load(&self) -> Option<f32> {
        let word = self.word.load(Ordering::Acquire);
        ((word & PRESENT) != 0).then(|| f32::from_bits(word as u32))
    }

    /// A subscription handler writing into this cell.
    pub fn writer(&self) -> impl FnMut(f32) + Send + 'static {
        let cell = self.clone();
        move |value| cell.store(value)
    }
}

/// Input feedback a surface can show on top of its readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feedback {
    /// Held down until released.
    Pressed,
    /// Briefly lit after a knob turn.
    Highlighted,
}

impl Feedback {
    const fn bit(self) -> u8 {
        match self {
            Self::Pressed => 0b01,
            Self::Highlighted => 0b10,
        }
    }
}

/// Feedback flags of one instrument, shared between the bridge (writer) and
/// the instrument's render task (reader).
#[derive(Debug, Clone, Default)]
pub struct FeedbackCell {
    bits: Arc<AtomicU8>,
}

impl FeedbackCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, feedback: Feedback, on: bool) {
        if on {
            self.bits.fetch_or(feedback.bit(), Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!feedback.bit(), Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_set(&self, feedback: Feedback) -> bool {
        self.bits.load(Ordering::Acquire) & feedback.bit() != 0
    }

    pub fn clear(&self) {
        self.bits.store(0, Ordering::Release);
    }
}

/// Point-in-time copy of a task's cells, in source order, plus the
/// instrument's input feedback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    values: Vec<Option<f32>>,
    pressed: bool,
    highlighted: bool,
}

impl Readings {
    #[must_use]
    pub fn snapshot(cells: &[ValueCell]) -> Self {
        Self {
            values: cells.iter().map(ValueCell::load).collect(),
            ..Self::default()
        }
    }

    /// Copies the current flags of `feedback` into this snapshot.
    #[must_use]
    pub fn with_feedback(mut self, feedback: &FeedbackCell) -> Self {
        self.pressed = feedback.is_set(Feedback::Pressed);
        self.highlighted = feedback.is_set(Feedback::Highlighted);
        self
    }

    /// The instrument's control is held down. Draw it inverted.
    #[must_use]
    pub const fn is_pressed(&self) -> bool {
        self.pressed
    }

    /// The instrument's knob was just turned.
    #[must_use]
    pub const fn is_highlighted(&self) -> bool {
        self.highlighted
    }

    #[must_use]
    pub fn get(&self, source: usize) -> Option<f32> {
        self.values.get(source).copied().flatten()
    }

    /// The first source. Most instruments have exactly one.
    #[must_use]
    pub fn primary(&self) -> Option<f32> {
        self.get(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Option<f32>> + '_ {
        self.values.iter().copied()
    }
}

impl From<Vec<Option<f32>>> for Readings {
    fn from(values: Vec<Option<f32>>) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }
}

/// Text for a numeric instrument: `"X"` when the value is missing or NaN,
/// otherwise the value with `decimals` fractional digits.
#[must_use]
pub fn format_value(value: Option<f32>, decimals: usize) -> String {
    match value {
        Some(v) if !v.is_nan() => format!("{v:.decimals$}"),
        _ => "X".to_owned(),
    }
}
