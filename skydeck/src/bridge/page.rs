//! Pages of instruments and input bindings.
//!
//! A profile is a list of pages. Only one page is on screen at a time: its
//! telemetry instruments run as render tasks, its static instruments are
//! drawn once, and its bindings translate control input into simulator
//! commands. An instrument tied to a control shows that control's press and
//! turn feedback.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::link::Frequency;
use crate::render::{DrawFn, Readings, SurfaceId};

/// Names a physical control (a knob, a key, a button).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlId(String);

impl ControlId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ControlId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Input from the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    /// A key or knob was pushed.
    Press(ControlId),
    /// A pushed key was let go.
    Release(ControlId),
    /// Every control currently touched. Held controls missing from the
    /// list are released.
    Held(Vec<ControlId>),
    /// A knob turned. Positive deltas are clockwise.
    Rotate { control: ControlId, delta: i32 },
    /// A page button was pushed.
    SelectPage(usize),
}

/// Simulator commands bound to one control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub control: ControlId,
    #[serde(default)]
    pub pressed: Option<String>,
    #[serde(default)]
    pub inc: Option<String>,
    #[serde(default)]
    pub dec: Option<String>,
}

impl Binding {
    #[must_use]
    pub fn new(control: impl Into<ControlId>) -> Self {
        Self {
            control: control.into(),
            pressed: None,
            inc: None,
            dec: None,
        }
    }

    #[must_use]
    pub fn on_press(mut self, command: impl Into<String>) -> Self {
        self.pressed = Some(command.into());
        self
    }

    #[must_use]
    pub fn on_inc(mut self, command: impl Into<String>) -> Self {
        self.inc = Some(command.into());
        self
    }

    #[must_use]
    pub fn on_dec(mut self, command: impl Into<String>) -> Self {
        self.dec = Some(command.into());
        self
    }
}

/// Something drawn on one surface.
///
/// With a data reference it is a gauge: the bridge subscribes it and a
/// render task redraws it at `frequency`. Without one it is a static label
/// drawn once when its page loads, with empty readings.
///
/// Tied to a control, it is redrawn whenever that control is pressed,
/// released or turned, with [`Readings::is_pressed`] and
/// [`Readings::is_highlighted`] set accordingly.
pub struct Instrument<C> {
    pub surface: SurfaceId,
    pub data_ref: Option<String>,
    /// Subscription and redraw rate. `None` (or zero) uses the bridge
    /// default.
    pub frequency: Option<Frequency>,
    pub control: Option<ControlId>,
    pub draw: DrawFn<C>,
}

impl<C> Instrument<C> {
    /// A telemetry-driven instrument.
    pub fn gauge(
        surface: SurfaceId,
        data_ref: impl Into<String>,
        draw: impl Fn(&Readings, &mut C) + Send + Sync + 'static,
    ) -> Self {
        Self {
            surface,
            data_ref: Some(data_ref.into()),
            frequency: None,
            control: None,
            draw: Arc::new(draw),
        }
    }

    /// A static instrument.
    pub fn label(
        surface: SurfaceId,
        draw: impl Fn(&Readings, &mut C) + Send + Sync + 'static,
    ) -> Self {
        Self {
            surface,
            data_ref: None,
            frequency: None,
            control: None,
            draw: Arc::new(draw),
        }
    }

    #[must_use]
    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = Some(frequency);
        self
    }

    #[must_use]
    pub fn with_control(mut self, control: impl Into<ControlId>) -> Self {
        self.control = Some(control.into());
        self
    }

    /// Whether input on `control` changes how this instrument looks.
    #[must_use]
    pub fn shows(&self, control: &ControlId) -> bool {
        self.control.as_ref() == Some(control)
    }
}

impl<C> fmt::Debug for Instrument<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("surface", &self.surface)
            .field("data_ref", &self.data_ref)
            .field("frequency", &self.frequency)
            .field("control", &self.control)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Page<C> {
    pub name: String,
    pub instruments: Vec<Instrument<C>>,
    pub bindings: Vec<Binding>,
}

impl<C> Page<C> {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruments: Vec::new(),
            bindings: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_instrument(mut self, instrument: Instrument<C>) -> Self {
        self.instruments.push(instrument);
        self
    }

    #[must_use]
    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Binding for `control` on this page.
    #[must_use]
    pub fn binding(&self, control: &ControlId) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.control == *control)
    }

    /// Command bound to `event` on this page, if any.
    ///
    /// Only positive deltas count as `inc`; zero turns `dec` like any
    /// other non-positive delta. Releases and page selection map to nothing.
    #[must_use]
    pub fn command_for(&self, event: &InputEvent) -> Option<&str> {
        let command = match event {
            InputEvent::Press(control) => self.binding(control)?.pressed.as_ref(),
            InputEvent::Rotate { control, delta } if *delta > 0 => {
                self.binding(control)?.inc.as_ref()
            }
            InputEvent::Rotate { control, .. } => self.binding(control)?.dec.as_ref(),
            InputEvent::Release(_) | InputEvent::Held(_) | InputEvent::SelectPage(_) => None,
        };
        command.map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heading_page() -> Page<String> {
        Page::new("autopilot")
            .with_binding(
                Binding::new("knobTL")
                    .on_press("sim/autopilot/heading_sync")
                    .on_inc("sim/autopilot/heading_up")
                    .on_dec("sim/autopilot/heading_down"),
            )
            .with_binding(Binding::new("knobCL").on_inc("sim/autopilot/altitude_up"))
    }

    fn rotate(control: &str, delta: i32) -> InputEvent {
        InputEvent::Rotate {
            control: control.into(),
            delta,
        }
    }

    #[test]
    fn press_and_rotate_resolve_commands() {
        let page = heading_page();
        assert_eq!(
            page.command_for(&InputEvent::Press("knobTL".into())),
            Some("sim/autopilot/heading_sync")
        );
        assert_eq!(page.command_for(&rotate("knobTL", 2)), Some("sim/autopilot/heading_up"));
        assert_eq!(page.command_for(&rotate("knobTL", -1)), Some("sim/autopilot/heading_down"));
    }

    #[test]
    fn zero_delta_turns_down() {
        let page = heading_page();
        assert_eq!(page.command_for(&rotate("knobTL", 0)), Some("sim/autopilot/heading_down"));
        assert_eq!(page.command_for(&rotate("knobCL", 0)), None);
    }

    #[test]
    fn missing_bindings_resolve_to_nothing() {
        let page = heading_page();
        assert_eq!(page.command_for(&rotate("knobCL", -1)), None);
        assert_eq!(page.command_for(&InputEvent::Release("knobTL".into())), None);
        assert_eq!(page.command_for(&InputEvent::Held(Vec::new())), None);
        assert_eq!(page.command_for(&InputEvent::Press("knobCL".into())), None);
        assert_eq!(page.command_for(&InputEvent::Press("knobBR".into())), None);
        assert_eq!(page.command_for(&InputEvent::SelectPage(0)), None);
    }

    #[test]
    fn instrument_kinds() {
        let gauge = Instrument::<String>::gauge(SurfaceId::new(0), "sim/a", |_, _| {})
            .with_frequency(Frequency::new(4));
        assert_eq!(gauge.data_ref.as_deref(), Some("sim/a"));
        assert_eq!(gauge.frequency, Some(Frequency::new(4)));

        let label = Instrument::<String>::label(SurfaceId::new(1), |_, text: &mut String| {
            text.push_str("HDG");
        });
        assert!(label.data_ref.is_none());
        assert!(format!("{label:?}").contains("surface"));

        let key = Instrument::<String>::label(SurfaceId::new(2), |_, _| {}).with_control("key2");
        assert!(key.shows(&"key2".into()));
        assert!(!key.shows(&"key3".into()));
        assert!(!label.shows(&"key2".into()));
    }
}
