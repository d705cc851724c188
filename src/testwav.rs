//! Hand-built WAV fixtures for tests, so no binary assets are checked in.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// A mono 16-bit PCM WAV holding `frames` samples of constant `amplitude`.
pub fn wav_bytes(sample_rate: u32, frames: usize, amplitude: f32) -> Vec<u8> {
    let data_len = (frames * 2) as u32;
    let block_align = 2u16;
    let sample = (amplitude.clamp(-1.0, 1.0) * 32_767.0) as i16;

    let mut out = Vec::with_capacity(44 + frames * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * u32::from(block_align)).to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for _ in 0..frames {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Write a fixture WAV to a unique temp path. Callers remove it when done.
pub fn write_temp_wav(sample_rate: u32, frames: usize, amplitude: f32) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "world-audio-fixture-{}-{n}.wav",
        std::process::id()
    ));
    std::fs::write(&path, wav_bytes(sample_rate, frames, amplitude))
        .unwrap_or_else(|err| panic!("cannot write fixture {}: {err}", path.display()));
    path
}
