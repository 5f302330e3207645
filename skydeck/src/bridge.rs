//! Bridge event loop.
//!
//! One thread owns the telemetry link, the render scheduler and the page
//! state. Everything else (input devices, signal handlers, the CLI) talks to
//! it through a [`BridgeHandle`]: events go over a crossbeam channel and a
//! mio [`Waker`] interrupts the loop's poll.
//!
//! ```text
//!  BridgeHandle ──BridgeEvent──> ┌──────────── skydeck-loop ────────────┐
//!                                │ drain events                          │
//!      simulator ──datagrams──>  │ link.pump / link.poll_liveness        │
//!                                │ scheduler.tick ──DrawJob──> draw queue│──> Renderer
//!                                │ poll(timeout = next deadline)         │
//!                                └───────────────────────────────────────┘
//! ```
//!
//! Every instrument of every page is subscribed up front, so switching
//! pages only restarts render tasks. Values keep flowing into each
//! instrument's [`ValueCell`] whether or not its page is on screen.
//!
//! # Input feedback
//!
//! A pressed control stays pressed until its `Release` (or a `Held` list
//! that omits it). A turned knob is highlighted for
//! [`BridgeConfig::highlight`]; turning it again meanwhile does not extend
//! that. Highlight expiry runs on the loop's own timer wheel, so it follows
//! the bridge clock like every other deadline. Switching pages clears both.

pub mod page;

use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link::{Frequency, LinkError, TelemetryLink};
use crate::net::{Transport, UdpSocket};
use crate::render::{
    Feedback, FeedbackCell, Readings, RenderScheduler, Renderer, SchedulerConfig, SchedulerError,
    TaskSpec, ValueCell,
};
use crate::runtime::timing::{Clock, MonoInstant, SystemClock, TimerHandle, TimerWheel};
use crate::trace::{debug, info, trace, warn};

pub use page::{Binding, ControlId, InputEvent, Instrument, Page};

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Highlight timers: one slot per millisecond, enough for any sane
/// highlight without wrapping.
const HIGHLIGHT_SLOTS: usize = 1024;
const MAX_HIGHLIGHTS: NonZeroUsize = NonZeroUsize::MIN.saturating_add(63);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("default frequency must be at least 1 Hz")]
    ZeroFrequency,
    #[error("event loop I/O error")]
    Io(#[from] io::Error),
    /// The loop has exited; the event was not delivered.
    #[error("bridge loop has exited")]
    Closed,
    #[error("bridge thread panicked")]
    ThreadPanicked,
}

/// Messages accepted by the bridge loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Input(InputEvent),
    /// Send a simulator command directly.
    Command(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Page shown at startup. Out of range falls back to the first page.
    pub default_page: usize,
    /// Rate for instruments that don't set one, or set zero. Must not be
    /// zero itself.
    pub default_frequency: Frequency,
    /// How long a turned knob stays highlighted.
    pub highlight: Duration,
    /// Upper bound on one poll wait, so a stalled deadline can't park the
    /// loop.
    pub max_poll_wait: Duration,
    pub scheduler: SchedulerConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_page: 0,
            default_frequency: Frequency::new(10),
            highlight: Duration::from_millis(200),
            max_poll_wait: Duration::from_millis(50),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub const fn with_default_page(mut self, page: usize) -> Self {
        self.default_page = page;
        self
    }

    #[must_use]
    pub const fn with_default_frequency(mut self, frequency: Frequency) -> Self {
        self.default_frequency = frequency;
        self
    }

    #[must_use]
    pub const fn with_highlight(mut self, highlight: Duration) -> Self {
        self.highlight = highlight;
        self
    }

    #[must_use]
    pub const fn with_max_poll_wait(mut self, wait: Duration) -> Self {
        self.max_poll_wait = wait;
        self
    }

    #[must_use]
    pub const fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

/// A page plus the cell feeding each of its instruments.
struct LoadedPage<C> {
    page: Page<C>,
    /// Parallel to `page.instruments`; `None` for static instruments.
    cells: Vec<Option<ValueCell>>,
    /// Parallel to `page.instruments`.
    feedback: Vec<FeedbackCell>,
}

impl<C> LoadedPage<C> {
    fn readings(&self, i: usize) -> Readings {
        let readings = match &self.cells[i] {
            Some(cell) => Readings::snapshot(std::slice::from_ref(cell)),
            None => Readings::default(),
        };
        readings.with_feedback(&self.feedback[i])
    }
}

/// Rate an instrument subscribes and redraws at.
fn rate<C>(instrument: &Instrument<C>, default: Frequency) -> Frequency {
    instrument
        .frequency
        .filter(|f| !f.is_zero())
        .unwrap_or(default)
}

/// Cross-thread handle to a bridge loop.
#[derive(Clone)]
pub struct BridgeHandle {
    events: Sender<BridgeEvent>,
    waker: Arc<Waker>,
}

impl BridgeHandle {
    /// Delivers `event` and wakes the loop.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Closed`] once the loop has exited,
    /// [`BridgeError::Io`] if the wake-up fails.
    pub fn send(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        self.events.send(event).map_err(|_| BridgeError::Closed)?;
        self.waker.wake()?;
        Ok(())
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn input(&self, event: InputEvent) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Input(event))
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn select_page(&self, page: usize) -> Result<(), BridgeError> {
        self.input(InputEvent::SelectPage(page))
    }

    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_command(&self, command: impl Into<String>) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Command(command.into()))
    }

    /// Asks the loop to tear down and exit.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn shutdown(&self) -> Result<(), BridgeError> {
        self.send(BridgeEvent::Shutdown)
    }
}

/// The bridge: link, scheduler and pages driven by one loop.
pub struct Bridge<R: Renderer, T: Transport = UdpSocket, K: Clock = SystemClock> {
    link: TelemetryLink<T>,
    scheduler: RenderScheduler<R>,
    pages: Vec<LoadedPage<R::Context>>,
    current: Option<usize>,
    pressed: HashSet<ControlId>,
    highlighted: HashMap<ControlId, TimerHandle>,
    highlight_timers: TimerWheel<ControlId>,
    clock: K,
    config: BridgeConfig,
    events_tx: Sender<BridgeEvent>,
    events_rx: Receiver<BridgeEvent>,
    poll: Poll,
    waker: Arc<Waker>,
}

impl<R: Renderer, T: Transport, K: Clock> Bridge<R, T, K> {
    /// Subscribes every gauge of every page, starts the draw worker and
    /// shows the default page.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ZeroFrequency`] if the default rate is zero.
    /// Otherwise fails if a data reference can't be subscribed, the draw
    /// worker can't start or the poller can't be created.
    pub fn new(
        mut link: TelemetryLink<T>,
        renderer: R,
        pages: Vec<Page<R::Context>>,
        clock: K,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        if config.default_frequency.is_zero() {
            return Err(BridgeError::ZeroFrequency);
        }
        let scheduler = RenderScheduler::new(renderer, config.scheduler, clock.now())?;

        let mut loaded = Vec::with_capacity(pages.len());
        for page in pages {
            let mut cells = Vec::with_capacity(page.instruments.len());
            for instrument in &page.instruments {
                let Some(data_ref) = &instrument.data_ref else {
                    cells.push(None);
                    continue;
                };
                let cell = ValueCell::new();
                let frequency = rate(instrument, config.default_frequency);
                let _index = link.subscribe(data_ref.as_str(), frequency, cell.writer())?;
                debug!(page = %page.name, index = %_index, data_ref = %data_ref, "instrument subscribed");
                cells.push(Some(cell));
            }
            let feedback = page.instruments.iter().map(|_| FeedbackCell::new()).collect();
            loaded.push(LoadedPage {
                page,
                cells,
                feedback,
            });
        }

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut bridge = Self {
            link,
            scheduler,
            pages: loaded,
            current: None,
            pressed: HashSet::new(),
            highlighted: HashMap::new(),
            highlight_timers: TimerWheel::new(HIGHLIGHT_SLOTS, MAX_HIGHLIGHTS, clock.now()),
            clock,
            config,
            events_tx,
            events_rx,
            poll,
            waker,
        };
        let start = if bridge.config.default_page < bridge.pages.len() {
            bridge.config.default_page
        } else {
            0
        };
        bridge.select_page(start);
        Ok(bridge)
    }

    /// A handle for other threads.
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            events: self.events_tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Switches to page `index`: stops the current page's tasks (discarding
    /// their queued draws), drops its input feedback, then draws the new
    /// page.
    ///
    /// Returns `false` and changes nothing if `index` is out of range.
    pub fn select_page(&mut self, index: usize) -> bool {
        if index >= self.pages.len() {
            debug!(index, pages = self.pages.len(), "no such page");
            return false;
        }
        self.scheduler.stop_all();
        self.clear_feedback();
        self.current = Some(index);
        let loaded = &self.pages[index];

        let now = self.clock.now();
        let mut tasks = 0;
        let parts = loaded.page.instruments.iter().zip(&loaded.cells).zip(&loaded.feedback);
        for ((instrument, cell), feedback) in parts {
            let draw = Arc::clone(&instrument.draw);
            let Some(cell) = cell else {
                let readings = Readings::default().with_feedback(feedback);
                self.scheduler
                    .draw_once(instrument.surface, move |ctx| draw(&readings, ctx));
                continue;
            };
            let spec = TaskSpec {
                surface: instrument.surface,
                frequency: rate(instrument, self.config.default_frequency),
                sources: vec![cell.clone()],
                feedback: feedback.clone(),
                draw,
            };
            match self.scheduler.start_task(spec, now) {
                Ok(_) => tasks += 1,
                Err(_e) => {
                    warn!(surface = %instrument.surface, error = %_e, "cannot start render task");
                }
            }
        }
        info!(page = %loaded.page.name, index, tasks, "page loaded");
        true
    }

    /// Applies one input event. Returns `true` if a command was sent.
    pub fn handle_input(&mut self, event: &InputEvent) -> bool {
        match event {
            InputEvent::SelectPage(index) => {
                self.select_page(*index);
                return false;
            }
            InputEvent::Press(control) => {
                if self.pressed.insert(control.clone()) {
                    self.show(control, Feedback::Pressed, true);
                }
            }
            InputEvent::Release(control) => {
                self.release(control);
                return false;
            }
            InputEvent::Held(touched) => {
                let stale: Vec<ControlId> = self
                    .pressed
                    .iter()
                    .filter(|c| !touched.contains(c))
                    .cloned()
                    .collect();
                for control in &stale {
                    self.release(control);
                }
                return false;
            }
            InputEvent::Rotate { control, .. } => self.highlight(control),
        }
        let Some(page) = self.current.and_then(|i| self.pages.get(i)) else {
            return false;
        };
        let Some(command) = page.page.command_for(event) else {
            debug!(event = ?event, "unbound input");
            return false;
        };
        match self.link.send_command(command) {
            Ok(()) => true,
            Err(_e) => {
                warn!(command, error = %_e, "command not sent");
                false
            }
        }
    }

    fn release(&mut self, control: &ControlId) {
        if self.pressed.remove(control) {
            self.show(control, Feedback::Pressed, false);
        }
    }

    /// Lights `control` until the highlight expires. No-op while it is
    /// already lit or when nothing on the page shows it.
    fn highlight(&mut self, control: &ControlId) {
        if self.highlighted.contains_key(control) {
            return;
        }
        if self.show(control, Feedback::Highlighted, true) == 0 {
            return;
        }
        let expires = self.clock.now() + self.config.highlight;
        match self.highlight_timers.schedule_at(expires, control.clone()) {
            Ok(timer) => {
                self.highlighted.insert(control.clone(), timer);
            }
            Err(_e) => {
                warn!(control = %control, error = %_e, "cannot schedule highlight expiry");
                self.show(control, Feedback::Highlighted, false);
            }
        }
    }

    /// Sets `feedback` on every instrument of the current page tied to
    /// `control` and redraws them. Returns how many were redrawn.
    fn show(&self, control: &ControlId, feedback: Feedback, on: bool) -> usize {
        let Some(loaded) = self.current.and_then(|i| self.pages.get(i)) else {
            return 0;
        };
        let mut redrawn = 0;
        for (i, instrument) in loaded.page.instruments.iter().enumerate() {
            if !instrument.shows(control) {
                continue;
            }
            loaded.feedback[i].set(feedback, on);
            let readings = loaded.readings(i);
            let draw = Arc::clone(&instrument.draw);
            self.scheduler
                .draw_once(instrument.surface, move |ctx| draw(&readings, ctx));
            redrawn += 1;
        }
        trace!(control = %control, ?feedback, on, redrawn, "input feedback");
        redrawn
    }

    /// Drops every press and highlight without redrawing.
    fn clear_feedback(&mut self) {
        self.pressed.clear();
        for (_, timer) in self.highlighted.drain() {
            self.highlight_timers.cancel(timer);
        }
        if let Some(loaded) = self.current.and_then(|i| self.pages.get(i)) {
            for feedback in &loaded.feedback {
                feedback.clear();
            }
        }
    }

    fn expire_highlights(&mut self, now: MonoInstant) {
        let mut expired = Vec::new();
        self.highlight_timers
            .advance(now, |_, control| expired.push(control));
        for control in expired {
            if self.highlighted.remove(&control).is_some() {
                self.show(&control, Feedback::Highlighted, false);
            }
        }
    }

    /// Whether `control` is held down.
    #[must_use]
    pub fn is_pressed(&self, control: &ControlId) -> bool {
        self.pressed.contains(control)
    }

    /// Whether `control` is lit from a recent turn.
    #[must_use]
    pub fn is_highlighted(&self, control: &ControlId) -> bool {
        self.highlighted.contains_key(control)
    }

    /// Applies one event. Returns `false` for [`BridgeEvent::Shutdown`].
    pub fn handle_event(&mut self, event: BridgeEvent) -> bool {
        match event {
            BridgeEvent::Input(input) => {
                self.handle_input(&input);
            }
            BridgeEvent::Command(command) => {
                if let Err(_e) = self.link.send_command(&command) {
                    warn!(command = %command, error = %_e, "command not sent");
                }
            }
            BridgeEvent::Shutdown => return false,
        }
        true
    }

    /// Applies every queued event. Returns `false` once shutdown was asked.
    pub fn drain_events(&mut self) -> bool {
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    if !self.handle_event(event) {
                        return false;
                    }
                }
                Err(TryRecvError::Empty) => return true,
                // Unreachable while `self` holds a sender.
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// One loop iteration without waiting: receive telemetry, run the
    /// liveness check, expire highlights and fire due render ticks.
    ///
    /// Returns how long the loop may sleep before the next deadline.
    pub fn step(&mut self) -> Duration {
        let now = self.clock.now();
        self.link.pump(now);
        self.link.poll_liveness(now);
        self.expire_highlights(now);
        self.scheduler.tick(now);
        self.poll_timeout(now)
    }

    fn poll_timeout(&self, now: MonoInstant) -> Duration {
        [
            self.link.next_deadline(),
            self.scheduler.next_deadline(),
            self.highlight_timers.next_deadline(),
        ]
            .into_iter()
            .flatten()
            .min()
            .map_or(self.config.max_poll_wait, |deadline| {
                deadline
                    .saturating_duration_since(now)
                    .min(self.config.max_poll_wait)
            })
    }

    /// Index of the page on screen.
    #[must_use]
    pub const fn current_page(&self) -> Option<usize> {
        self.current
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub const fn link(&self) -> &TelemetryLink<T> {
        &self.link
    }

    #[must_use]
    pub const fn scheduler(&self) -> &RenderScheduler<R> {
        &self.scheduler
    }

    /// Unsubscribes everything, stops all render tasks and closes the
    /// renderer once draws already queued have run.
    ///
    /// Returns the renderer, or `None` if the draw worker panicked.
    pub fn shutdown(self) -> Option<R> {
        let Self {
            mut link,
            scheduler,
            ..
        } = self;
        link.close();
        scheduler.shutdown()
    }
}

impl<R, T, K> Bridge<R, T, K>
where
    R: Renderer,
    T: Transport + Source,
    K: Clock,
{
    /// Runs the loop on the calling thread until [`BridgeEvent::Shutdown`],
    /// then tears down as [`shutdown`](Self::shutdown) does.
    ///
    /// # Errors
    ///
    /// Registering the socket or polling fails.
    pub fn run(mut self) -> Result<Option<R>, BridgeError> {
        if let Some(transport) = self.link.transport_mut() {
            self.poll
                .registry()
                .register(transport, SOCKET, Interest::READABLE)?;
        }
        let mut events = Events::with_capacity(16);
        info!(simulator = %self.link.simulator(), "bridge running");

        while self.drain_events() {
            let timeout = self.step();
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(transport) = self.link.transport_mut() {
            let _ = self.poll.registry().deregister(transport);
        }
        info!("bridge stopping");
        Ok(self.shutdown())
    }
}

impl<R, T, K> Bridge<R, T, K>
where
    R: Renderer,
    T: Transport + Source + 'static,
    K: Clock + 'static,
{
    /// Runs the loop on a new `skydeck-loop` thread.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Io`] if the thread can't be spawned.
    pub fn spawn(self) -> Result<BridgeThread<R>, BridgeError> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("skydeck-loop".into())
            .spawn(move || self.run())?;
        Ok(BridgeThread { handle, join })
    }
}

/// A bridge loop running on its own thread.
pub struct BridgeThread<R> {
    handle: BridgeHandle,
    join: JoinHandle<Result<Option<R>, BridgeError>>,
}

impl<R> BridgeThread<R> {
    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    /// Asks the loop to stop and waits for it.
    ///
    /// # Errors
    ///
    /// The loop's own error, or [`BridgeError::ThreadPanicked`].
    pub fn shutdown(self) -> Result<Option<R>, BridgeError> {
        // Already exited loops report through join.
        let _ = self.handle.shutdown();
        self.join()
    }

    /// Waits for the loop to exit on its own.
    ///
    /// # Errors
    ///
    /// The loop's own error, or [`BridgeError::ThreadPanicked`].
    pub fn join(self) -> Result<Option<R>, BridgeError> {
        self.join.join().map_err(|_| BridgeError::ThreadPanicked)?
    }
}
