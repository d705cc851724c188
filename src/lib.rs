//! Threaded game audio: named sound banks, 3D one-shot effects, and
//! streamed background music behind a thread-safe facade.
//!
//! A dedicated worker thread owns all audio state (banks, playing voices,
//! the output stream) and the rest of the game talks to it through
//! [`AudioManager`], which only ever enqueues commands. Voices are
//! reclaimed by the worker itself once they finish, so nothing is ever
//! freed while the output callback might still touch it.
//!
//! ```no_run
//! use world_audio::{AudioConfig, AudioManager};
//!
//! # fn main() -> anyhow::Result<()> {
//! let audio = AudioManager::new(AudioConfig::default())?;
//! audio.load("coin", "assets/coin.wav", 1.0, 10.0, 0.8);
//! audio.load_bgm("overworld", "assets/overworld.ogg", 0.5);
//!
//! audio.play_bgm("overworld", 1.0);
//! audio.set_listener_position([0.0, 1.7, 0.0], [0.0, 0.0, -1.0]);
//! audio.play_3d("coin", [3.0, 1.0, -2.0]);
//! # Ok(())
//! # }
//! ```

mod bank;
mod decode;
mod manager;
mod spatial;
mod stream;
mod worker;

#[cfg(test)]
pub(crate) mod testwav;

pub use manager::{AudioConfig, AudioManager, OutputMode};
