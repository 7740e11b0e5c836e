use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Action Space
// =============================================================================

/// NES controller buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    B,
    Select,
    Start,
    Up,
    Down,
    Left,
    Right,
    A,
}

/// Multi-binary slot layout used for NES games. Slot 1 has no button bound
/// to it and is ignored when the action is applied.
pub const NES_BUTTONS: [Option<Button>; 9] = [
    Some(Button::B),
    None,
    Some(Button::Select),
    Some(Button::Start),
    Some(Button::Up),
    Some(Button::Down),
    Some(Button::Left),
    Some(Button::Right),
    Some(Button::A),
];

/// One decision: a bitmask over the multi-binary slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(u16);

impl Action {
    pub const NOOP: Action = Action(0);

    pub fn from_bits(bits: u16) -> Self {
        Action(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// Builds an action from one flag per slot. Slots past 16 are ignored.
    pub fn from_pressed(pressed: &[bool]) -> Self {
        let bits = pressed
            .iter()
            .take(16)
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0u16, |acc, (i, _)| acc | (1 << i));
        Action(bits)
    }

    pub fn is_pressed(self, slot: usize) -> bool {
        slot < 16 && self.0 & (1 << slot) != 0
    }

    pub fn with_button(self, button: Button) -> Self {
        match NES_BUTTONS.iter().position(|b| *b == Some(button)) {
            Some(slot) => Action(self.0 | (1 << slot)),
            None => self,
        }
    }

    /// Buttons held by this action under the NES slot layout.
    pub fn buttons(self) -> impl Iterator<Item = Button> {
        NES_BUTTONS
            .into_iter()
            .enumerate()
            .filter_map(move |(slot, b)| b.filter(|_| self.is_pressed(slot)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionSpace {
    /// Number of independent binary slots.
    pub slots: usize,
}

impl ActionSpace {
    pub fn nes() -> Self {
        Self {
            slots: NES_BUTTONS.len(),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        let pressed: Vec<bool> = (0..self.slots).map(|_| rng.random::<bool>()).collect();
        Action::from_pressed(&pressed)
    }
}

// =============================================================================
// Observations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationSpace {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ObservationSpace {
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ObservationSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Image observation, row-major with channels last (HWC).
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
    pub data: Vec<u8>,
}

impl Observation {
    pub fn zeros(space: ObservationSpace) -> Self {
        Self {
            height: space.height,
            width: space.width,
            channels: space.channels,
            data: vec![0; space.len()],
        }
    }

    pub fn space(&self) -> ObservationSpace {
        ObservationSpace {
            height: self.height,
            width: self.width,
            channels: self.channels,
        }
    }

    pub fn pixel(&self, y: usize, x: usize) -> &[u8] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }
}

/// Game variables exposed alongside each step (`lives`, `score`, `time`, ...).
pub type Info = BTreeMap<String, i64>;

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub observation: Observation,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Info,
}

impl Step {
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

// =============================================================================
// Environment Contract
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    #[default]
    Headless,
    Human,
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Headless => f.write_str("headless"),
            RenderMode::Human => f.write_str("human"),
        }
    }
}

/// Everything fixed at construction time of an environment handle. Changing
/// any field means building a new handle.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvSpec {
    pub game: PathBuf,
    pub scenario: PathBuf,
    pub state: Option<PathBuf>,
    pub render_mode: RenderMode,
    pub record_dir: Option<PathBuf>,
}

pub trait Environment {
    fn observation_space(&self) -> ObservationSpace;
    fn action_space(&self) -> ActionSpace;
    fn reset(&mut self) -> Result<Observation>;
    fn step(&mut self, action: Action) -> Result<Step>;
    fn render(&mut self) -> Result<()>;
    /// Releases the handle. Calling it more than once is a no-op.
    fn close(&mut self) -> Result<()>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn observation_space(&self) -> ObservationSpace {
        (**self).observation_space()
    }

    fn action_space(&self) -> ActionSpace {
        (**self).action_space()
    }

    fn reset(&mut self) -> Result<Observation> {
        (**self).reset()
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        (**self).step(action)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Builds environment handles. Failures are reported as
/// [`crate::Error::EnvironmentConstruction`].
pub trait EnvProvider {
    fn make(&self, spec: &EnvSpec) -> Result<Box<dyn Environment>>;
}
