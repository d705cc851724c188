//! The thread-safe facade every other part of the game talks to.
//!
//! [`AudioManager`] owns the command channel and the worker thread join
//! handle; dropping it shuts the worker down. All methods take `&self` and
//! may be called from any thread. Loading decodes on the caller's thread
//! (loads happen on loading screens and may block); playback methods only
//! enqueue a command and return.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Sender;

use crate::bank::BankEntry;
use crate::decode::render_sample;
use crate::spatial::Listener;
use crate::stream::StreamingTrack;
use crate::worker::{Command, PlaybackRequest, WorkerIo, worker_main};

/// State shared between the facade and the worker. Everything here is
/// atomic or mutex-guarded; f32 values are packed into `AtomicU32` bits.
pub(crate) struct Shared {
    pub sample_rate: u32,
    pub channels: usize,
    /// Listener position then forward, one atomic per component. The six
    /// words are not read as a unit; a torn frame's worth of listener
    /// movement is inaudible.
    listener_bits: [AtomicU32; 6],
    pub bgm_volume_bits: AtomicU32,
    pub bgm_playing: AtomicBool,
    pub bgm_name: Mutex<Option<String>>,
    pub started_voices: AtomicU64,
    pub completed_voices: AtomicU64,
    pub active_voices: AtomicUsize,
    pub dropped_requests: AtomicU64,
    pub underruns: AtomicU64,
}

impl Shared {
    fn new(sample_rate: u32, channels: usize) -> Self {
        let listener = Listener::default();
        let bits = |v: f32| AtomicU32::new(v.to_bits());
        Self {
            sample_rate,
            channels,
            listener_bits: [
                bits(listener.position[0]),
                bits(listener.position[1]),
                bits(listener.position[2]),
                bits(listener.forward[0]),
                bits(listener.forward[1]),
                bits(listener.forward[2]),
            ],
            bgm_volume_bits: AtomicU32::new(1.0f32.to_bits()),
            bgm_playing: AtomicBool::new(false),
            bgm_name: Mutex::new(None),
            started_voices: AtomicU64::new(0),
            completed_voices: AtomicU64::new(0),
            active_voices: AtomicUsize::new(0),
            dropped_requests: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    fn set_listener(&self, position: [f32; 3], forward: [f32; 3]) {
        for (slot, v) in self.listener_bits[..3].iter().zip(position) {
            slot.store(v.to_bits(), Ordering::Release);
        }
        for (slot, v) in self.listener_bits[3..].iter().zip(forward) {
            slot.store(v.to_bits(), Ordering::Release);
        }
    }

    pub(crate) fn listener(&self) -> Listener {
        let read = |i: usize| f32::from_bits(self.listener_bits[i].load(Ordering::Acquire));
        Listener {
            position: [read(0), read(1), read(2)],
            forward: [read(3), read(4), read(5)],
        }
    }

    pub(crate) fn bgm_volume(&self) -> f32 {
        f32::from_bits(self.bgm_volume_bits.load(Ordering::Acquire))
    }
}

/// Where mixed audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// The default host's default output device.
    #[default]
    Device,
    /// No device; the worker discards what it mixes. The whole pipeline
    /// still runs, which is what tests on machines without audio need.
    Null,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Audio queued ahead of the output callback, in milliseconds.
    pub queue_ms: u32,
    /// Requested device buffer size; clamped to what the backend supports.
    pub preferred_buffer_frames: u32,
    pub output: OutputMode,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            queue_ms: 80,
            preferred_buffer_frames: 256,
            output: OutputMode::Device,
        }
    }
}

pub struct AudioManager {
    tx: Sender<Command>,
    shared: Arc<Shared>,
    /// Names with a successfully installed template, so `play` can answer
    /// its bank-miss check without asking the worker.
    sound_names: Mutex<HashSet<String>>,
    bgm_names: Mutex<HashSet<String>>,
    worker: Option<JoinHandle<()>>,
}

impl AudioManager {
    pub fn new(cfg: AudioConfig) -> anyhow::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let (io, sample_rate, channels) = match cfg.output {
            OutputMode::Null => (WorkerIo::Null, 44_100, 2),
            OutputMode::Device => {
                let host = cpal::default_host();
                let device = host
                    .default_output_device()
                    .ok_or_else(|| anyhow!("no default output device"))?;

                log::info!(
                    "audio: output device: {}",
                    match device.description() {
                        Ok(desc) => format!("{desc:?}"),
                        Err(_) => "<unknown>".to_string(),
                    }
                );

                let (config, sample_format) =
                    pick_output_config(&device, cfg.preferred_buffer_frames)?;
                let sample_rate = config.sample_rate;
                let channels = config.channels as usize;
                (
                    WorkerIo::Device {
                        device,
                        config,
                        sample_format,
                    },
                    sample_rate,
                    channels,
                )
            }
        };

        let shared = Arc::new(Shared::new(sample_rate, channels));
        let queue_ms = cfg.queue_ms.max(10);

        let worker = std::thread::Builder::new()
            .name("audio-worker".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || worker_main(io, shared, rx, queue_ms, ready_tx)
            })
            .context("spawn audio worker")?;

        // The output stream is built on the worker thread; surface its
        // failure here so construction is all-or-nothing.
        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(anyhow!("audio worker exited during startup"));
            }
        }

        Ok(Self {
            tx,
            shared,
            sound_names: Mutex::new(HashSet::new()),
            bgm_names: Mutex::new(HashSet::new()),
            worker: Some(worker),
        })
    }

    /// Decode a one-shot effect and install it under `name`, replacing any
    /// previous entry with that name. Returns false if the file could not
    /// be read or decoded; failures never panic and never unload the
    /// previous entry.
    pub fn load(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        min_distance: f32,
        max_distance: f32,
        volume: f32,
    ) -> bool {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) => {
                log::warn!("audio: cannot read {}: {err}", path.display());
                return false;
            }
        };

        let hint_ext = path.extension().and_then(|s| s.to_str());
        let Some(sample) =
            render_sample(bytes, self.shared.sample_rate, self.shared.channels, hint_ext, name)
        else {
            return false;
        };

        let entry = BankEntry::new(sample, min_distance, max_distance, volume);
        let Ok(mut names) = self.sound_names.lock() else {
            return false;
        };
        // Send while holding the lock, so a play that sees the name also
        // has its request ordered after the install on the channel.
        if self
            .tx
            .send(Command::InstallSound {
                name: name.to_string(),
                entry,
            })
            .is_err()
        {
            return false;
        }
        names.insert(name.to_string());
        true
    }

    /// Open a music track for streaming and install it under `name` with
    /// `volume` as its base volume. The file stays open; audio is decoded
    /// incrementally while the track plays.
    pub fn load_bgm(&self, name: &str, path: impl AsRef<Path>, volume: f32) -> bool {
        let Some(track) = StreamingTrack::open(
            path.as_ref(),
            self.shared.sample_rate,
            self.shared.channels,
        ) else {
            return false;
        };

        let volume = if volume.is_finite() { volume.clamp(0.0, 1.0) } else { 1.0 };
        let Ok(mut names) = self.bgm_names.lock() else {
            return false;
        };
        if self
            .tx
            .send(Command::InstallBgm {
                name: name.to_string(),
                track,
                volume,
            })
            .is_err()
        {
            return false;
        }
        names.insert(name.to_string());
        true
    }

    /// Start a non-spatialized instance of `name`. Returns false if no
    /// sound with that name has been loaded.
    pub fn play(&self, name: &str) -> bool {
        self.enqueue_play(name, None)
    }

    /// Start a spatialized instance of `name` at a world position. The
    /// voice is attenuated and panned against the listener each mixed
    /// block, so it tracks listener movement while playing.
    pub fn play_3d(&self, name: &str, position: [f32; 3]) -> bool {
        self.enqueue_play(name, Some(position))
    }

    fn enqueue_play(&self, name: &str, position: Option<[f32; 3]>) -> bool {
        let known = self
            .sound_names
            .lock()
            .map(|names| names.contains(name))
            .unwrap_or(false);
        if !known {
            log::debug!("audio: play of unloaded sound {name:?}");
            return false;
        }
        self.tx
            .send(Command::Play(PlaybackRequest {
                name: name.to_string(),
                position,
            }))
            .is_ok()
    }

    /// Start the named music track from its beginning at its base volume
    /// scaled by `volume`, replacing whatever track was playing. Returns
    /// false if no track with that name has been loaded.
    pub fn play_bgm(&self, name: &str, volume: f32) -> bool {
        let known = self
            .bgm_names
            .lock()
            .map(|names| names.contains(name))
            .unwrap_or(false);
        if !known {
            log::debug!("audio: play_bgm of unloaded track {name:?}");
            return false;
        }
        let volume = if volume.is_finite() { volume.max(0.0) } else { 1.0 };
        self.tx
            .send(Command::PlayBgm {
                name: name.to_string(),
                volume,
            })
            .is_ok()
    }

    pub fn stop_bgm(&self) {
        let _ = self.tx.send(Command::StopBgm);
    }

    /// Nudge the music volume by `delta` steps of 0.05, clamped to [0, 1].
    /// Does nothing when no track is playing.
    pub fn change_volume(&self, delta: f32) {
        if !delta.is_finite() {
            return;
        }
        let _ = self.tx.send(Command::NudgeBgmVolume { delta });
    }

    /// Publish the listener's position and facing. Call once per game
    /// frame; voices already playing pick the new state up on their next
    /// mixed block.
    pub fn set_listener_position(&self, position: [f32; 3], forward: [f32; 3]) {
        let finite =
            |v: [f32; 3]| v.iter().all(|c| c.is_finite());
        if !finite(position) || !finite(forward) {
            log::warn!("audio: ignoring non-finite listener state");
            return;
        }
        let forward = if forward.iter().map(|c| c * c).sum::<f32>() > 1e-12 {
            forward
        } else {
            Listener::default().forward
        };
        self.shared.set_listener(position, forward);
    }

    pub fn is_bgm_playing(&self) -> bool {
        self.shared.bgm_playing.load(Ordering::Acquire)
    }

    /// Name of the currently playing music track, if any.
    pub fn bgm_track(&self) -> Option<String> {
        self.shared.bgm_name.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn bgm_volume(&self) -> f32 {
        self.shared.bgm_volume()
    }

    pub fn active_voices(&self) -> usize {
        self.shared.active_voices.load(Ordering::Acquire)
    }

    pub fn started_voices(&self) -> u64 {
        self.shared.started_voices.load(Ordering::Relaxed)
    }

    pub fn completed_voices(&self) -> u64 {
        self.shared.completed_voices.load(Ordering::Relaxed)
    }

    /// Requests that never became a voice: unknown names that slipped past
    /// the facade check, plus anything still queued at shutdown.
    pub fn dropped_requests(&self) -> u64 {
        self.shared.dropped_requests.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn channels(&self) -> usize {
        self.shared.channels
    }

    /// Stop the worker and wait for it to exit. Equivalent to dropping the
    /// manager; still-queued playback requests are discarded.
    pub fn shutdown(self) {}

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

impl Drop for AudioManager {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn pick_output_config(
    device: &cpal::Device,
    preferred_buffer_frames: u32,
) -> anyhow::Result<(cpal::StreamConfig, cpal::SampleFormat)> {
    let mut supported = device
        .supported_output_configs()
        .context("supported_output_configs")?;

    let score_format = |sf: cpal::SampleFormat| match sf {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I16 => 1,
        cpal::SampleFormat::U16 => 2,
        _ => 3,
    };

    let preferred_sample_rate: u32 = 44_100;
    let supports_preferred_sr = |range: &cpal::SupportedStreamConfigRange| {
        range.min_sample_rate() <= preferred_sample_rate
            && preferred_sample_rate <= range.max_sample_rate()
    };

    // Lower is better.
    let score_range = |range: &cpal::SupportedStreamConfigRange| {
        let sr_score: u32 = if supports_preferred_sr(range) { 0 } else { 1 };
        let ch_score: u32 = if range.channels() == 2 { 0 } else { 1 };
        let fmt_score: u32 = score_format(range.sample_format());
        (sr_score, ch_score, fmt_score)
    };

    let mut best: Option<cpal::SupportedStreamConfigRange> = None;
    while let Some(range) = supported.next() {
        let is_better = best
            .as_ref()
            .map(|b| score_range(&range) < score_range(b))
            .unwrap_or(true);
        if is_better {
            best = Some(range);
        }
    }
    let best = best.ok_or_else(|| anyhow!("no supported output configs"))?;

    // Most game assets are 44100Hz; preferring it avoids resampling on load.
    let supported_config = if supports_preferred_sr(&best) {
        best.with_sample_rate(preferred_sample_rate)
    } else {
        best.with_max_sample_rate()
    };
    let sample_format = supported_config.sample_format();
    let mut config: cpal::StreamConfig = supported_config.config();

    // Clamp requested buffer size if the backend supports it.
    if let cpal::SupportedBufferSize::Range { min, max } = best.buffer_size() {
        config.buffer_size = cpal::BufferSize::Fixed(preferred_buffer_frames.clamp(*min, *max));
    }

    Ok((config, sample_format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testwav;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    fn null_manager() -> AudioManager {
        let _ = env_logger::builder().is_test(true).try_init();
        AudioManager::new(AudioConfig {
            output: OutputMode::Null,
            ..AudioConfig::default()
        })
        .unwrap()
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    struct TempWav(PathBuf);

    impl TempWav {
        fn new(frames: u32) -> Self {
            Self(testwav::write_temp_wav(22_050, frames as usize, 0.25))
        }
    }

    impl Drop for TempWav {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn play_of_unknown_name_returns_false_without_side_effects() {
        let audio = null_manager();
        assert!(!audio.play("nope"));
        assert!(!audio.play_3d("nope", [1.0, 0.0, 0.0]));
        assert!(!audio.play_bgm("nope", 1.0));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(audio.started_voices(), 0);
        assert!(!audio.is_bgm_playing());
    }

    #[test]
    fn load_of_missing_file_fails_cleanly() {
        let audio = null_manager();
        assert!(!audio.load("ghost", "no/such/file.wav", 1.0, 10.0, 1.0));
        assert!(!audio.load_bgm("ghost", "no/such/file.ogg", 1.0));
        assert!(!audio.play("ghost"));
    }

    #[test]
    fn concurrent_plays_each_start_exactly_one_voice() {
        let wav = TempWav::new(20_000);
        let audio = null_manager();
        assert!(audio.load("step", &wav.0, 1.0, 10.0, 0.5));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        assert!(audio.play("step"));
                    }
                });
            }
        });

        wait_until("all 100 voices to start", || audio.started_voices() == 100);
    }

    #[test]
    fn finished_voices_are_reclaimed() {
        let wav = TempWav::new(200);
        let audio = null_manager();
        assert!(audio.load("blip", &wav.0, 1.0, 10.0, 1.0));

        assert!(audio.play_3d("blip", [2.0, 0.0, 0.0]));
        wait_until("the voice to finish", || {
            audio.completed_voices() == 1 && audio.active_voices() == 0
        });
        assert_eq!(audio.started_voices(), 1);
    }

    #[test]
    fn bgm_switch_keeps_a_single_current_track() {
        let a = TempWav::new(5_000);
        let b = TempWav::new(5_000);
        let audio = null_manager();
        assert!(audio.load_bgm("menu", &a.0, 1.0));
        assert!(audio.load_bgm("level", &b.0, 1.0));

        assert!(audio.play_bgm("menu", 1.0));
        wait_until("menu bgm", || audio.bgm_track().as_deref() == Some("menu"));
        assert!(audio.is_bgm_playing());

        assert!(audio.play_bgm("level", 1.0));
        wait_until("level bgm", || audio.bgm_track().as_deref() == Some("level"));
        assert!(audio.is_bgm_playing());
    }

    #[test]
    fn stop_bgm_clears_the_current_track() {
        let wav = TempWav::new(5_000);
        let audio = null_manager();
        assert!(audio.load_bgm("menu", &wav.0, 1.0));
        assert!(audio.play_bgm("menu", 0.8));
        wait_until("bgm playing", || audio.is_bgm_playing());

        audio.stop_bgm();
        wait_until("bgm stopped", || {
            !audio.is_bgm_playing() && audio.bgm_track().is_none()
        });
    }

    #[test]
    fn change_volume_steps_and_clamps() {
        let bgm = TempWav::new(5_000);
        let audio = null_manager();
        assert!(audio.load_bgm("menu", &bgm.0, 1.0));
        assert!(audio.play_bgm("menu", 0.5));
        wait_until("bgm at half volume", || (audio.bgm_volume() - 0.5).abs() < 1e-6);

        // One step is 0.05.
        audio.change_volume(2.0);
        wait_until("volume nudged up", || (audio.bgm_volume() - 0.6).abs() < 1e-6);

        audio.change_volume(1000.0);
        wait_until("volume clamped high", || audio.bgm_volume() == 1.0);

        audio.change_volume(-1000.0);
        wait_until("volume clamped low", || audio.bgm_volume() == 0.0);
    }

    #[test]
    fn change_volume_is_a_noop_without_bgm() {
        let wav = TempWav::new(200);
        let audio = null_manager();
        assert!(audio.load("blip", &wav.0, 1.0, 10.0, 1.0));

        audio.change_volume(10.0);
        // The later play is handled after the nudge, so once the voice has
        // started the nudge has been processed.
        assert!(audio.play("blip"));
        wait_until("sentinel voice", || audio.started_voices() == 1);
        assert_eq!(audio.bgm_volume(), 1.0);
    }

    #[test]
    fn reloading_a_name_replaces_the_entry() {
        let first = TempWav::new(200);
        let second = TempWav::new(400);
        let audio = null_manager();

        assert!(audio.load("blip", &first.0, 1.0, 10.0, 1.0));
        assert!(audio.play("blip"));
        wait_until("first voice", || audio.completed_voices() == 1);

        assert!(audio.load("blip", &second.0, 1.0, 10.0, 1.0));
        assert!(audio.play("blip"));
        wait_until("second voice", || audio.completed_voices() == 2);
        assert_eq!(audio.started_voices(), 2);
    }

    #[test]
    fn listener_updates_are_visible_immediately() {
        let audio = null_manager();
        audio.set_listener_position([1.0, 2.0, 3.0], [0.0, 0.0, 1.0]);
        let listener = audio.shared().listener();
        assert_eq!(listener.position, [1.0, 2.0, 3.0]);
        assert_eq!(listener.forward, [0.0, 0.0, 1.0]);

        // A zero facing falls back to the default rather than breaking the
        // pan math.
        audio.set_listener_position([0.0; 3], [0.0; 3]);
        assert_eq!(audio.shared().listener().forward, [0.0, 0.0, -1.0]);
    }

    #[test]
    fn shutdown_with_queued_requests_joins_cleanly() {
        let wav = TempWav::new(20_000);
        let audio = null_manager();
        assert!(audio.load("step", &wav.0, 1.0, 10.0, 1.0));

        for _ in 0..50 {
            assert!(audio.play("step"));
        }
        let shared = audio.shared();
        drop(audio);

        // Every request either became a voice or was counted as dropped,
        // and shutdown left nothing active.
        let started = shared.started_voices.load(Ordering::Relaxed);
        let dropped = shared.dropped_requests.load(Ordering::Relaxed);
        assert_eq!(started + dropped, 50);
        assert_eq!(shared.active_voices.load(Ordering::Acquire), 0);
        assert!(!shared.bgm_playing.load(Ordering::Acquire));
    }

    #[test]
    fn repeated_init_and_shutdown_cycles() {
        let wav = TempWav::new(200);
        for _ in 0..3 {
            let audio = null_manager();
            assert!(audio.load("blip", &wav.0, 1.0, 10.0, 1.0));
            assert!(audio.play("blip"));
        }
    }
}
