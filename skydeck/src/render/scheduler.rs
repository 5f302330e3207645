//! Render task scheduler.
//!
//! Each render task is a self-pacing loop: on every tick it snapshots its
//! value cells, enqueues one draw job and reschedules itself through its
//! [`FramePacer`]. Ticks live on a [`TimerWheel`] driven by the owner's
//! clock, so the whole scheduler is deterministic under a `ManualClock`.
//!
//! # Task states
//!
//! ```text
//! Created ──first tick──> Running ──stop() / disabled at tick──> Stopped
//!                            ↺ tick
//! ```
//!
//! `Stopped` is terminal; restarting means starting a new task.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pacing::FramePacer;
use super::queue::{DrawQueue, QueueCounters};
use super::{DrawFn, FeedbackCell, Readings, RenderError, Renderer, SurfaceId, ValueCell};
use crate::link::Frequency;
use crate::runtime::timing::{MonoInstant, TimerHandle, TimerWheel, WheelError};
use crate::trace::{debug, info, warn};

/// Scheduler sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Timer wheel slots (1 ms each), rounded up to a power of two.
    pub wheel_slots: usize,
    /// Most tasks that can be running at once.
    pub max_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wheel_slots: 2048,
            max_tasks: 64,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots;
        self
    }

    #[must_use]
    pub const fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max;
        self
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("render frequency must be greater than zero")]
    ZeroFrequency,
    #[error(transparent)]
    Timer(#[from] WheelError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Identifies a render task for its whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTaskId(u64);

impl fmt::Display for RenderTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Stopped,
}

/// What a render task draws and how often.
pub struct TaskSpec<C> {
    pub surface: SurfaceId,
    pub frequency: Frequency,
    /// Cells snapshotted on every tick, in this order.
    pub sources: Vec<ValueCell>,
    /// Input feedback copied into every snapshot.
    pub feedback: FeedbackCell,
    pub draw: DrawFn<C>,
}

impl<C> fmt::Debug for TaskSpec<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("surface", &self.surface)
            .field("frequency", &self.frequency)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

/// Disables a render task.
///
/// [`stop`](Self::stop) works from any thread: the task exits at its next
/// tick. [`RenderScheduler::stop`] additionally cancels the pending tick.
#[derive(Debug, Clone)]
pub struct StopHandle {
    id: RenderTaskId,
    enabled: Arc<AtomicBool>,
}

impl StopHandle {
    #[must_use]
    pub const fn id(&self) -> RenderTaskId {
        self.id
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

struct Task<C> {
    surface: SurfaceId,
    sources: Vec<ValueCell>,
    feedback: FeedbackCell,
    draw: DrawFn<C>,
    pacer: FramePacer,
    enabled: Arc<AtomicBool>,
    state: TaskState,
    timer: Option<TimerHandle>,
}

/// Owns the render tasks, their timers and the draw queue.
pub struct RenderScheduler<R: Renderer> {
    wheel: TimerWheel<RenderTaskId>,
    tasks: HashMap<RenderTaskId, Task<R::Context>>,
    queue: DrawQueue<R>,
    next_id: u64,
    /// Reused across ticks.
    fired: Vec<RenderTaskId>,
}

impl<R: Renderer> RenderScheduler<R> {
    /// Starts the draw worker with `renderer`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Render`] if the draw worker can't be spawned.
    pub fn new(
        renderer: R,
        config: SchedulerConfig,
        now: MonoInstant,
    ) -> Result<Self, SchedulerError> {
        let capacity = NonZeroUsize::new(config.max_tasks).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            wheel: TimerWheel::new(config.wheel_slots, capacity, now),
            tasks: HashMap::with_capacity(capacity.get()),
            queue: DrawQueue::spawn(renderer)?,
            next_id: 0,
            fired: Vec::with_capacity(capacity.get()),
        })
    }

    /// Registers a task. Its first tick fires on the next [`tick`](Self::tick)
    /// past `now`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ZeroFrequency`], or [`SchedulerError::Timer`] when
    /// `max_tasks` are already running.
    pub fn start_task(
        &mut self,
        spec: TaskSpec<R::Context>,
        now: MonoInstant,
    ) -> Result<StopHandle, SchedulerError> {
        let pacer = FramePacer::new(spec.frequency, now).ok_or(SchedulerError::ZeroFrequency)?;
        let id = RenderTaskId(self.next_id);
        let timer = self.wheel.schedule_at(now, id)?;
        self.next_id += 1;

        let enabled = Arc::new(AtomicBool::new(true));
        debug!(
            task = %id,
            surface = %spec.surface,
            frequency = %spec.frequency,
            interval_ms = pacer.interval().as_millis() as u64,
            "render task started"
        );
        self.tasks.insert(
            id,
            Task {
                surface: spec.surface,
                sources: spec.sources,
                feedback: spec.feedback,
                draw: spec.draw,
                pacer,
                enabled: Arc::clone(&enabled),
                state: TaskState::Created,
                timer: Some(timer),
            },
        );
        Ok(StopHandle { id, enabled })
    }

    /// Disables the task and cancels its pending tick.
    ///
    /// Returns `false` if it had already stopped. No draw job is enqueued
    /// for it after this returns.
    pub fn stop(&mut self, handle: &StopHandle) -> bool {
        handle.stop();
        let Some(task) = self.tasks.remove(&handle.id) else {
            return false;
        };
        if let Some(timer) = task.timer {
            self.wheel.cancel(timer);
        }
        debug!(task = %handle.id, "render task stopped");
        true
    }

    /// Stops every task, discards their queued draw jobs and waits until the
    /// draw worker has caught up.
    ///
    /// Returns the number of tasks stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.halt_tasks();
        self.queue.invalidate();
        if !self.queue.flush() {
            warn!("draw worker gone while stopping tasks");
        }
        info!(stopped, "all render tasks stopped");
        stopped
    }

    /// Disables and unschedules every task. Jobs already queued still run.
    fn halt_tasks(&mut self) -> usize {
        let stopped = self.tasks.len();
        for (_, task) in self.tasks.drain() {
            task.enabled.store(false, Ordering::Release);
            if let Some(timer) = task.timer {
                self.wheel.cancel(timer);
            }
        }
        stopped
    }

    /// Fires every tick due at `now`. Returns the number of draw jobs
    /// enqueued.
    pub fn tick(&mut self, now: MonoInstant) -> usize {
        let mut fired = mem::take(&mut self.fired);
        fired.clear();
        self.wheel.advance(now, |_, id| fired.push(id));

        let mut enqueued = 0;
        for &id in &fired {
            if self.run_tick(id, now) {
                enqueued += 1;
            }
        }
        self.fired = fired;
        enqueued
    }

    fn run_tick(&mut self, id: RenderTaskId, now: MonoInstant) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        task.timer = None;

        if !task.enabled.load(Ordering::Acquire) {
            task.state = TaskState::Stopped;
            self.tasks.remove(&id);
            debug!(task = %id, "render task disabled, exiting");
            return false;
        }
        task.state = TaskState::Running;

        let readings = Readings::snapshot(&task.sources).with_feedback(&task.feedback);
        let draw = Arc::clone(&task.draw);
        let queued = self
            .queue
            .enqueue(task.surface, move |ctx| draw(&readings, ctx));

        let next = now + task.pacer.next_delay(now);
        match self.wheel.schedule_at(next, id) {
            Ok(timer) => task.timer = Some(timer),
            Err(_e) => {
                warn!(task = %id, error = %_e, "cannot reschedule render task");
                self.tasks.remove(&id);
            }
        }
        queued
    }

    /// Enqueues a single draw outside any task, e.g. a static label.
    pub fn draw_once(
        &self,
        surface: SurfaceId,
        job: impl FnOnce(&mut R::Context) + Send + 'static,
    ) -> bool {
        self.queue.enqueue(surface, job)
    }

    /// State of a task. `None` for ids this scheduler never issued.
    #[must_use]
    pub fn state(&self, id: RenderTaskId) -> Option<TaskState> {
        match self.tasks.get(&id) {
            Some(task) => Some(task.state),
            None if id.0 < self.next_id => Some(TaskState::Stopped),
            None => None,
        }
    }

    /// Earliest pending tick.
    #[must_use]
    pub fn next_deadline(&self) -> Option<MonoInstant> {
        self.wheel.next_deadline()
    }

    /// Number of live tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Blocks until every draw job enqueued so far has been handled.
    pub fn flush(&self) -> bool {
        self.queue.flush()
    }

    #[must_use]
    pub fn counters(&self) -> QueueCounters {
        self.queue.counters()
    }

    /// Stops every task, lets the draw worker finish what is already
    /// queued, closes the renderer and hands it back.
    ///
    /// `None` if the draw worker panicked.
    pub fn shutdown(mut self) -> Option<R> {
        let _stopped = self.halt_tasks();
        debug!(stopped = _stopped, "render tasks halted for shutdown");
        self.queue.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::runtime::timing::{Clock, ManualClock};

    /// Collects the text painted for every draw.
    #[derive(Default)]
    struct TextPanel {
        frames: Arc<Mutex<Vec<(SurfaceId, String)>>>,
    }

    impl Renderer for TextPanel {
        type Context = String;

        fn draw(
            &mut self,
            surface: SurfaceId,
            paint: &mut dyn FnMut(&mut String),
        ) -> Result<(), RenderError> {
            let mut text = String::new();
            paint(&mut text);
            self.frames.lock().push((surface, text));
            Ok(())
        }
    }

    type Frames = Arc<Mutex<Vec<(SurfaceId, String)>>>;

    fn scheduler(clock: &ManualClock) -> (RenderScheduler<TextPanel>, Frames) {
        let panel = TextPanel::default();
        let frames = Arc::clone(&panel.frames);
        let scheduler =
            RenderScheduler::new(panel, SchedulerConfig::default(), clock.now()).unwrap();
        (scheduler, frames)
    }

    fn spec(surface: u16, hz: u16, cell: &ValueCell) -> TaskSpec<String> {
        TaskSpec {
            surface: SurfaceId::new(surface),
            frequency: Frequency::new(hz),
            sources: vec![cell.clone()],
            feedback: FeedbackCell::new(),
            draw: Arc::new(|readings: &Readings, text: &mut String| {
                *text = crate::render::format_value(readings.primary(), 0);
            }),
        }
    }

    /// Steps the clock 1 ms at a time for `millis`, ticking each step.
    fn run_for(
        scheduler: &mut RenderScheduler<TextPanel>,
        clock: &ManualClock,
        millis: u64,
    ) -> usize {
        (0..millis)
            .map(|_| scheduler.tick(clock.advance(Duration::from_millis(1))))
            .sum()
    }

    #[test]
    fn five_hz_for_two_seconds() {
        let clock = ManualClock::new();
        let (mut scheduler, _frames) = scheduler(&clock);
        let handle = scheduler
            .start_task(spec(0, 5, &ValueCell::new()), clock.now())
            .unwrap();

        assert_eq!(run_for(&mut scheduler, &clock, 1_999), 10);

        assert!(scheduler.stop(&handle));
        assert_eq!(run_for(&mut scheduler, &clock, 3_000), 0);
        assert_eq!(scheduler.state(handle.id()), Some(TaskState::Stopped));
    }

    #[test]
    fn state_moves_created_running_stopped() {
        let clock = ManualClock::new();
        let (mut scheduler, _frames) = scheduler(&clock);
        let handle = scheduler
            .start_task(spec(0, 10, &ValueCell::new()), clock.now())
            .unwrap();

        assert_eq!(scheduler.state(handle.id()), Some(TaskState::Created));
        run_for(&mut scheduler, &clock, 1);
        assert_eq!(scheduler.state(handle.id()), Some(TaskState::Running));

        // Stopping from the handle alone takes effect at the next tick.
        handle.stop();
        assert_eq!(run_for(&mut scheduler, &clock, 200), 0);
        assert_eq!(scheduler.state(handle.id()), Some(TaskState::Stopped));
        assert!(scheduler.is_empty());
        assert!(!scheduler.stop(&handle));
    }

    #[test]
    fn zero_frequency_is_rejected() {
        let clock = ManualClock::new();
        let (mut scheduler, _frames) = scheduler(&clock);
        let err = scheduler
            .start_task(spec(0, 0, &ValueCell::new()), clock.now())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ZeroFrequency));
        assert_eq!(scheduler.state(RenderTaskId(0)), None);
    }

    #[test]
    fn draws_latest_value_snapshot() {
        let clock = ManualClock::new();
        let (mut scheduler, frames) = scheduler(&clock);
        let airspeed = ValueCell::new();
        scheduler
            .start_task(spec(4, 10, &airspeed), clock.now())
            .unwrap();

        run_for(&mut scheduler, &clock, 1);
        airspeed.store(118.6);
        run_for(&mut scheduler, &clock, 100);
        scheduler.flush();

        let frames = frames.lock();
        assert_eq!(
            frames.as_slice(),
            [
                (SurfaceId::new(4), "X".to_owned()),
                (SurfaceId::new(4), "119".to_owned()),
            ]
        );
    }

    #[test]
    fn stop_all_discards_queued_jobs() {
        let clock = ManualClock::new();
        let (mut scheduler, frames) = scheduler(&clock);
        let cell = ValueCell::new();
        let handles: Vec<_> = (0..3)
            .map(|s| scheduler.start_task(spec(s, 20, &cell), clock.now()).unwrap())
            .collect();
        run_for(&mut scheduler, &clock, 500);

        assert_eq!(scheduler.stop_all(), 3);
        let drawn = frames.lock().len();
        assert_eq!(run_for(&mut scheduler, &clock, 500), 0);
        scheduler.flush();
        assert_eq!(frames.lock().len(), drawn);
        assert!(handles.iter().all(|h| !h.is_enabled()));
        assert_eq!(scheduler.next_deadline(), None);
    }

    #[test]
    fn tasks_are_bounded_by_config() {
        let clock = ManualClock::new();
        let mut scheduler = RenderScheduler::new(
            TextPanel::default(),
            SchedulerConfig::default().with_max_tasks(1),
            clock.now(),
        )
        .unwrap();
        let cell = ValueCell::new();
        scheduler.start_task(spec(0, 1, &cell), clock.now()).unwrap();
        let err = scheduler
            .start_task(spec(1, 1, &cell), clock.now())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Timer(_)));
    }

    #[test]
    fn shutdown_returns_renderer() {
        let clock = ManualClock::new();
        let (mut scheduler, _frames) = scheduler(&clock);
        scheduler.draw_once(SurfaceId::new(7), |text| text.push_str("NAV"));
        let panel = scheduler.shutdown().unwrap();
        assert_eq!(
            panel.frames.lock().as_slice(),
            [(SurfaceId::new(7), "NAV".to_owned())]
        );
    }

    #[test]
    fn shutdown_keeps_queued_draws_but_stops_tasks() {
        let clock = ManualClock::new();
        let (mut scheduler, _frames) = scheduler(&clock);
        let cell = ValueCell::new();
        cell.store(42.0);
        let handle = scheduler.start_task(spec(0, 10, &cell), clock.now()).unwrap();
        assert_eq!(scheduler.tick(clock.advance(Duration::from_millis(1))), 1);
        scheduler.draw_once(SurfaceId::new(7), |text| text.push_str("NAV"));

        let panel = scheduler.shutdown().unwrap();
        assert!(!handle.is_enabled());
        assert_eq!(
            panel.frames.lock().as_slice(),
            [
                (SurfaceId::new(0), "42".to_owned()),
                (SurfaceId::new(7), "NAV".to_owned()),
            ]
        );
    }

    #[test]
    fn task_draws_carry_input_feedback() {
        let clock = ManualClock::new();
        let (mut scheduler, frames) = scheduler(&clock);
        let cell = ValueCell::new();
        let feedback = FeedbackCell::new();
        let spec = TaskSpec {
            feedback: feedback.clone(),
            draw: Arc::new(|readings: &Readings, text: &mut String| {
                *text = if readings.is_pressed() { "down" } else { "up" }.to_owned();
            }),
            ..spec(3, 10, &cell)
        };
        scheduler.start_task(spec, clock.now()).unwrap();

        run_for(&mut scheduler, &clock, 1);
        feedback.set(crate::render::Feedback::Pressed, true);
        run_for(&mut scheduler, &clock, 100);
        scheduler.flush();
        let texts: Vec<_> = frames.lock().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(texts, ["up", "down"]);
    }
}
