//! Chord detection over raw key transitions.
//!
//! Raw keyboard streams repeat key-down while a key is held. Chords here are
//! edge-triggered: a `Select` fires only when the digit goes from released to
//! pressed with both Ctrl and Shift already held.

use std::collections::HashSet;

use anyhow::Result;

use crate::history::SLOT_COUNT;

const CODE_1: u16 = 2;
const CODE_9: u16 = 10;
const CODE_LEFTCTRL: u16 = 29;
const CODE_LEFTSHIFT: u16 = 42;
const CODE_RIGHTSHIFT: u16 = 54;
const CODE_C: u16 = 46;
const CODE_RIGHTCTRL: u16 = 97;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    LeftCtrl,
    RightCtrl,
    LeftShift,
    RightShift,
    Digit(u8),
    C,
    Other(u16),
}

impl Key {
    /// Maps a Linux input event code (`KEY_*` in `input-event-codes.h`).
    pub fn from_code(code: u16) -> Self {
        match code {
            CODE_LEFTCTRL => Key::LeftCtrl,
            CODE_RIGHTCTRL => Key::RightCtrl,
            CODE_LEFTSHIFT => Key::LeftShift,
            CODE_RIGHTSHIFT => Key::RightShift,
            CODE_C => Key::C,
            CODE_1..=CODE_9 => Key::Digit((code - CODE_1 + 1) as u8),
            other => Key::Other(other),
        }
    }

    pub fn is_ctrl(self) -> bool {
        matches!(self, Key::LeftCtrl | Key::RightCtrl)
    }

    pub fn is_shift(self) -> bool {
        matches!(self, Key::LeftShift | Key::RightShift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Up,
    Down,
    Repeat,
}

impl Transition {
    /// evdev key values: 0 release, 1 press, 2 autorepeat.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Transition::Up),
            1 => Some(Transition::Down),
            2 => Some(Transition::Repeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChordEvent {
    Select(u8),
    CaptureCurrent,
}

#[derive(Debug, Default)]
pub struct KeyboardState {
    pressed: HashSet<Key>,
}

impl KeyboardState {
    /// Records a transition and reports whether it was a released→pressed edge.
    pub fn apply(&mut self, key: Key, transition: Transition) -> bool {
        match transition {
            Transition::Down => self.pressed.insert(key),
            Transition::Up => {
                self.pressed.remove(&key);
                false
            }
            Transition::Repeat => false,
        }
    }

    pub fn is_pressed(&self, key: Key) -> bool {
        self.pressed.contains(&key)
    }

    pub fn ctrl_held(&self) -> bool {
        self.is_pressed(Key::LeftCtrl) || self.is_pressed(Key::RightCtrl)
    }

    pub fn shift_held(&self) -> bool {
        self.is_pressed(Key::LeftShift) || self.is_pressed(Key::RightShift)
    }
}

pub struct ChordDetector {
    state: KeyboardState,
    capture_hotkey: bool,
}

impl ChordDetector {
    pub fn new(capture_hotkey: bool) -> Self {
        Self {
            state: KeyboardState::default(),
            capture_hotkey,
        }
    }

    pub fn handle(&mut self, key: Key, transition: Transition) -> Option<ChordEvent> {
        let newly_pressed = self.state.apply(key, transition);
        if !newly_pressed {
            return None;
        }
        match key {
            Key::Digit(digit) if (1..=SLOT_COUNT).contains(&digit) => {
                if self.state.ctrl_held() && self.state.shift_held() {
                    Some(ChordEvent::Select(digit))
                } else {
                    None
                }
            }
            Key::C if self.capture_hotkey && self.state.ctrl_held() => Some(ChordEvent::CaptureCurrent),
            _ => None,
        }
    }
}

/// Blocking source of raw key transitions.
pub trait KeyboardDevice: Send {
    fn next_events(&mut self) -> Result<Vec<(Key, Transition)>>;

    fn name(&self) -> String {
        "keyboard".to_string()
    }
}

#[cfg(feature = "evdev")]
pub use self::evdev_device::EvdevKeyboard;

#[cfg(feature = "evdev")]
mod evdev_device {
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result};
    use evdev::{Device, InputEventKind};
    use tracing::debug;

    use super::{Key, KeyboardDevice, Transition};

    pub struct EvdevKeyboard {
        device: Device,
        path: PathBuf,
    }

    impl EvdevKeyboard {
        pub fn open(path: &Path) -> Result<Self> {
            let device = Device::open(path)
                .with_context(|| format!("Failed to open keyboard device {}", path.display()))?;
            Ok(Self {
                device,
                path: path.to_path_buf(),
            })
        }

        /// First input device that reports Ctrl, Shift and the digit row.
        pub fn find() -> Result<Self> {
            for (path, device) in evdev::enumerate() {
                let Some(keys) = device.supported_keys() else {
                    continue;
                };
                let is_keyboard = keys.contains(evdev::Key::KEY_LEFTCTRL)
                    && keys.contains(evdev::Key::KEY_LEFTSHIFT)
                    && keys.contains(evdev::Key::KEY_1)
                    && keys.contains(evdev::Key::KEY_9);
                if is_keyboard {
                    debug!(path = %path.display(), name = device.name().unwrap_or(""), "found keyboard");
                    return Ok(Self { device, path });
                }
            }
            anyhow::bail!("No keyboard found")
        }
    }

    impl KeyboardDevice for EvdevKeyboard {
        fn next_events(&mut self) -> Result<Vec<(Key, Transition)>> {
            let events = self
                .device
                .fetch_events()
                .with_context(|| format!("Failed to read {}", self.path.display()))?;
            let mut out = Vec::new();
            for event in events {
                if let InputEventKind::Key(key) = event.kind() {
                    if let Some(transition) = Transition::from_value(event.value()) {
                        out.push((Key::from_code(key.code()), transition));
                    }
                }
            }
            Ok(out)
        }

        fn name(&self) -> String {
            let label = self.device.name().unwrap_or("keyboard");
            format!("{label} ({})", self.path.display())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(detector: &mut ChordDetector, events: &[(Key, Transition)]) -> Vec<ChordEvent> {
        events
            .iter()
            .filter_map(|(key, transition)| detector.handle(*key, *transition))
            .collect()
    }

    #[test]
    fn maps_linux_codes() {
        assert_eq!(Key::from_code(2), Key::Digit(1));
        assert_eq!(Key::from_code(10), Key::Digit(9));
        assert_eq!(Key::from_code(11), Key::Other(11));
        assert_eq!(Key::from_code(29), Key::LeftCtrl);
        assert_eq!(Key::from_code(97), Key::RightCtrl);
        assert_eq!(Key::from_code(54), Key::RightShift);
        assert_eq!(Key::from_code(46), Key::C);
        assert_eq!(Transition::from_value(2), Some(Transition::Repeat));
        assert_eq!(Transition::from_value(7), None);
    }

    #[test]
    fn ctrl_shift_digit_fires_once_while_held() {
        let mut detector = ChordDetector::new(false);
        let events = feed(
            &mut detector,
            &[
                (Key::LeftCtrl, Transition::Down),
                (Key::LeftShift, Transition::Down),
                (Key::Digit(3), Transition::Down),
                (Key::Digit(3), Transition::Repeat),
                (Key::Digit(3), Transition::Repeat),
                (Key::Digit(3), Transition::Down),
                (Key::LeftCtrl, Transition::Repeat),
            ],
        );
        assert_eq!(events, vec![ChordEvent::Select(3)]);
    }

    #[test]
    fn release_and_press_again_fires_again() {
        let mut detector = ChordDetector::new(false);
        let events = feed(
            &mut detector,
            &[
                (Key::RightCtrl, Transition::Down),
                (Key::RightShift, Transition::Down),
                (Key::Digit(2), Transition::Down),
                (Key::Digit(2), Transition::Up),
                (Key::Digit(2), Transition::Down),
            ],
        );
        assert_eq!(events, vec![ChordEvent::Select(2), ChordEvent::Select(2)]);
    }

    #[test]
    fn digit_without_both_modifiers_is_ignored() {
        let mut detector = ChordDetector::new(false);
        let events = feed(
            &mut detector,
            &[
                (Key::LeftCtrl, Transition::Down),
                (Key::Digit(1), Transition::Down),
                (Key::Digit(1), Transition::Up),
                (Key::LeftCtrl, Transition::Up),
                (Key::LeftShift, Transition::Down),
                (Key::Digit(1), Transition::Down),
            ],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn digit_held_before_modifiers_does_not_fire() {
        let mut detector = ChordDetector::new(false);
        let events = feed(
            &mut detector,
            &[
                (Key::Digit(4), Transition::Down),
                (Key::LeftCtrl, Transition::Down),
                (Key::LeftShift, Transition::Down),
                (Key::Digit(4), Transition::Repeat),
            ],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn capture_hotkey_respects_configuration() {
        let sequence = [
            (Key::LeftCtrl, Transition::Down),
            (Key::C, Transition::Down),
            (Key::C, Transition::Repeat),
            (Key::C, Transition::Up),
        ];
        let mut disabled = ChordDetector::new(false);
        assert!(feed(&mut disabled, &sequence).is_empty());

        let mut enabled = ChordDetector::new(true);
        assert_eq!(feed(&mut enabled, &sequence), vec![ChordEvent::CaptureCurrent]);
    }
}
