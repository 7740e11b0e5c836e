use anyhow::{Context, Result as AnyResult};
use std::path::PathBuf;
use tetanes_core::control_deck::HeadlessMode;
use tetanes_core::input::JoypadBtnState;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;
use tracing::{debug, info, warn};

use crate::env::{
    Action, ActionSpace, Button, EnvProvider, EnvSpec, Environment, Info, Observation,
    ObservationSpace, RenderMode, Step,
};
use crate::error::{Error, Result};
use crate::movie::MovieRecorder;
use crate::scenario::{Memory, Scenario};

pub const NES_WIDTH: usize = 256;
pub const NES_HEIGHT: usize = 240;

const START_PRESS_FRAMES: u32 = 2;
const START_PRESS_INTERVAL: u32 = 30;

fn joypad_flag(button: Button) -> JoypadBtnState {
    match button {
        Button::B => JoypadBtnState::B,
        Button::Select => JoypadBtnState::SELECT,
        Button::Start => JoypadBtnState::START,
        Button::Up => JoypadBtnState::UP,
        Button::Down => JoypadBtnState::DOWN,
        Button::Left => JoypadBtnState::LEFT,
        Button::Right => JoypadBtnState::RIGHT,
        Button::A => JoypadBtnState::A,
    }
}

fn blit_rgba_to_u32(fb: &[u8], out: &mut [u32]) {
    for (dst, src) in out.iter_mut().zip(fb.chunks_exact(4)) {
        *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
    }
}

struct DeckMemory<'a>(&'a ControlDeck);

impl Memory for DeckMemory<'_> {
    fn peek(&self, addr: u16) -> u8 {
        self.0.bus().peek(addr)
    }
}

// =============================================================================
// NES Environment
// =============================================================================

/// One emulator instance in a fixed configuration. The render mode and
/// recording target cannot change after construction.
pub struct NesEnv {
    deck: ControlDeck,
    game: PathBuf,
    state: Option<PathBuf>,
    scenario: Scenario,
    window: Option<minifb::Window>,
    display: Vec<u32>,
    recorder: Option<MovieRecorder>,
    prev_info: Info,
    episode_steps: u64,
    closed: bool,
}

impl NesEnv {
    pub fn new(spec: &EnvSpec) -> Result<Self> {
        Self::open(spec).map_err(|source| Error::EnvironmentConstruction {
            game: spec.game.clone(),
            source: source.into(),
        })
    }

    fn open(spec: &EnvSpec) -> AnyResult<Self> {
        let mut deck = ControlDeck::new();
        deck.set_headless_mode(HeadlessMode::NO_AUDIO);
        deck.load_rom_path(&spec.game)
            .with_context(|| format!("Failed to load ROM: {}", spec.game.display()))?;

        let scenario = Scenario::load(&spec.scenario)?;
        if let Some(state) = &spec.state {
            anyhow::ensure!(
                state.exists(),
                "save-state not found: {}",
                state.display()
            );
        }

        let window = match spec.render_mode {
            RenderMode::Human => {
                let title = spec
                    .game
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "NES".to_string());
                let mut window = minifb::Window::new(
                    &title,
                    NES_WIDTH,
                    NES_HEIGHT,
                    minifb::WindowOptions {
                        resize: true,
                        scale: minifb::Scale::X2,
                        ..Default::default()
                    },
                )
                .context("Failed to open display window")?;
                window.set_target_fps(60);
                Some(window)
            }
            RenderMode::Headless => None,
        };

        let recorder = spec
            .record_dir
            .as_deref()
            .map(|dir| MovieRecorder::new(dir, &spec.game, spec.state.as_deref()))
            .transpose()?;

        info!(
            game = %spec.game.display(),
            render_mode = %spec.render_mode,
            recording = recorder.is_some(),
            "emulator ready"
        );

        Ok(Self {
            deck,
            game: spec.game.clone(),
            state: spec.state.clone(),
            scenario,
            window,
            display: vec![0u32; NES_WIDTH * NES_HEIGHT],
            recorder,
            prev_info: Info::new(),
            episode_steps: 0,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::environment(format!(
                "environment for {} is closed",
                self.game.display()
            )));
        }
        Ok(())
    }

    fn clock_frame(&mut self) -> AnyResult<()> {
        self.deck.clock_frame()?;
        Ok(())
    }

    fn set_input(&mut self, action: Action) {
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            Button::B,
            Button::Select,
            Button::Start,
            Button::Up,
            Button::Down,
            Button::Left,
            Button::Right,
            Button::A,
        ] {
            joypad.set_button(joypad_flag(button), false);
        }
        for button in action.buttons() {
            joypad.set_button(joypad_flag(button), true);
        }
    }

    fn press_start(&mut self, frames: u32) -> AnyResult<()> {
        self.set_input(Action::NOOP.with_button(Button::Start));
        for _ in 0..frames {
            self.clock_frame()?;
        }
        self.set_input(Action::NOOP);
        Ok(())
    }

    fn boot(&mut self) -> AnyResult<()> {
        match self.state.clone() {
            Some(state) => {
                self.deck
                    .load_state(&state)
                    .with_context(|| format!("Failed to load state: {}", state.display()))?;
            }
            None => {
                for _ in 0..self.scenario.boot.wait_frames {
                    self.clock_frame()?;
                }
                for _ in 0..self.scenario.boot.start_presses {
                    self.press_start(START_PRESS_FRAMES)?;
                    for _ in 0..START_PRESS_INTERVAL {
                        self.clock_frame()?;
                    }
                }
            }
        }
        self.clock_frame()
    }

    fn observation(&mut self) -> Observation {
        let fb = self.deck.frame_buffer();
        let mut data = Vec::with_capacity(NES_WIDTH * NES_HEIGHT * 3);
        for px in fb.chunks_exact(4).take(NES_WIDTH * NES_HEIGHT) {
            data.extend_from_slice(&px[..3]);
        }
        data.resize(NES_WIDTH * NES_HEIGHT * 3, 0);
        Observation {
            height: NES_HEIGHT,
            width: NES_WIDTH,
            channels: 3,
            data,
        }
    }

    fn read_info(&self) -> Info {
        self.scenario.read_info(&DeckMemory(&self.deck))
    }
}

impl Environment for NesEnv {
    fn observation_space(&self) -> ObservationSpace {
        ObservationSpace {
            height: NES_HEIGHT,
            width: NES_WIDTH,
            channels: 3,
        }
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::nes()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.ensure_open()?;
        self.deck.reset(ResetKind::Hard);
        self.set_input(Action::NOOP);
        self.boot().map_err(Error::environment)?;
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.start_episode()?;
        }
        self.prev_info = self.read_info();
        self.episode_steps = 0;
        debug!(info = ?self.prev_info, "reset");
        Ok(self.observation())
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        self.ensure_open()?;
        self.set_input(action);
        self.clock_frame().map_err(Error::environment)?;
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(action);
        }
        self.episode_steps += 1;

        let info = self.read_info();
        let reward = self.scenario.reward(&self.prev_info, &info);
        let terminated = self.scenario.is_done(&self.prev_info, &info);
        let truncated = self.window.as_ref().is_some_and(|w| !w.is_open());
        self.prev_info = info.clone();

        Ok(Step {
            observation: self.observation(),
            reward,
            terminated,
            truncated,
            info,
        })
    }

    fn render(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.window.is_none() {
            return Ok(());
        }
        let fb = self.deck.frame_buffer();
        blit_rgba_to_u32(fb, &mut self.display);
        if let Some(window) = self.window.as_mut() {
            window
                .update_with_buffer(&self.display, NES_WIDTH, NES_HEIGHT)
                .map_err(Error::environment)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.window = None;
        if let Some(mut recorder) = self.recorder.take() {
            recorder.finish()?;
        }
        debug!(game = %self.game.display(), steps = self.episode_steps, "emulator closed");
        Ok(())
    }
}

impl Drop for NesEnv {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("failed to close emulator cleanly: {err}");
        }
    }
}

/// Builds [`NesEnv`] handles.
#[derive(Debug, Default, Clone)]
pub struct NesProvider;

impl EnvProvider for NesProvider {
    fn make(&self, spec: &EnvSpec) -> Result<Box<dyn Environment>> {
        Ok(Box::new(NesEnv::new(spec)?))
    }
}
