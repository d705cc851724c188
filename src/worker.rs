//! The dedicated audio worker thread.
//!
//! The worker owns everything with a lifetime: the sound and BGM banks, the
//! set of playing voices, and the output stream. Other threads only ever
//! talk to it through the command channel, so no instance is ever touched,
//! let alone freed, from two contexts at once. The cpal output callback is
//! deliberately dumb: it pops interleaved frames from a lock-free SPSC ring
//! buffer and converts the sample format, nothing else.
//!
//! Each loop iteration:
//! 1. sweep finished voices out of the active set (reclamation),
//! 2. wait on the command channel with a bounded timeout so the sweep and
//!    the ring-buffer top-up run even when nothing new is requested,
//! 3. realize queued playback requests into voices (FIFO),
//! 4. top the ring buffer up to the configured queue depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};

use crate::bank::{BankEntry, SampleData};
use crate::manager::Shared;
use crate::spatial::stereo_gains;
use crate::stream::StreamingTrack;

/// Bounded wait on the command channel; also the reclamation cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest block mixed in one go, in frames.
const MIX_CHUNK_FRAMES: usize = 1024;

/// A one-shot playback request. Immutable once enqueued; consumed exactly
/// once by the worker. `position` present means the voice is spatialized.
pub(crate) struct PlaybackRequest {
    pub name: String,
    pub position: Option<[f32; 3]>,
}

pub(crate) enum Command {
    InstallSound { name: String, entry: BankEntry },
    InstallBgm {
        name: String,
        track: StreamingTrack,
        volume: f32,
    },
    Play(PlaybackRequest),
    PlayBgm { name: String, volume: f32 },
    StopBgm,
    NudgeBgmVolume { delta: f32 },
    Shutdown,
}

/// How the mixed audio leaves the worker.
pub(crate) enum WorkerIo {
    /// Build a cpal output stream on the worker thread (`cpal::Stream` is
    /// not `Send`, so it cannot be built anywhere else).
    Device {
        device: cpal::Device,
        config: cpal::StreamConfig,
        sample_format: cpal::SampleFormat,
    },
    /// No device: the worker drains the ring buffer itself, so the full
    /// pipeline runs headless at faster than real time.
    Null,
}

struct BgmEntry {
    track: StreamingTrack,
    /// Base volume from `load_bgm`, scaled by the `play_bgm` argument.
    volume: f32,
}

/// One playing instance, spawned from a bank template. Owned by the worker
/// from creation until the sweep removes it.
struct Voice {
    sample: SampleData,
    frame_pos: usize,
    gain: f32,
    spatial: Option<SpatialParams>,
}

struct SpatialParams {
    position: [f32; 3],
    min_distance: f32,
    max_distance: f32,
}

#[derive(Default)]
struct WorkerState {
    sounds: HashMap<String, BankEntry>,
    bgm: HashMap<String, BgmEntry>,
    current_bgm: Option<String>,
    voices: Vec<Voice>,
}

pub(crate) fn worker_main(
    io: WorkerIo,
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    queue_ms: u32,
    ready_tx: Sender<anyhow::Result<()>>,
) {
    let channels = shared.channels;
    let queue_frames =
        ((u64::from(shared.sample_rate) * u64::from(queue_ms)) / 1000).max(256) as usize;

    let rb = HeapRb::<f32>::new(queue_frames * channels);
    let (mut prod, cons) = rb.split();

    // Prime with silence so the callback doesn't start out starved.
    let silence = vec![0.0f32; queue_frames * channels];
    let _ = prod.push_slice(&silence);

    let mut null_cons = None;
    let _stream;
    match io {
        WorkerIo::Device {
            device,
            config,
            sample_format,
        } => {
            let stream = match build_stream(&device, &config, sample_format, &shared, cons) {
                Ok(s) => s,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            if let Err(err) = cpal::traits::StreamTrait::play(&stream) {
                let _ = ready_tx.send(Err(anyhow!("failed to start output stream: {err}")));
                return;
            }
            _stream = Some(stream);
        }
        WorkerIo::Null => {
            _stream = None;
            null_cons = Some(cons);
        }
    }
    let _ = ready_tx.send(Ok(()));
    drop(ready_tx);

    log::debug!(
        "audio: worker up (sr={} ch={} queue_frames={})",
        shared.sample_rate,
        channels,
        queue_frames
    );

    let mut state = WorkerState::default();

    loop {
        reap_finished(&mut state, &shared);

        let mut shutdown = false;
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(cmd) => {
                shutdown = handle_command(cmd, &mut state, &shared);
                while !shutdown {
                    match rx.try_recv() {
                        Ok(cmd) => shutdown = handle_command(cmd, &mut state, &shared),
                        Err(_) => break,
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => shutdown = true,
        }
        if shutdown {
            break;
        }

        mix_into(&mut prod, &mut state, &shared, queue_frames, channels);

        if let Some(cons) = null_cons.as_mut() {
            drain_all(cons);
        }
    }

    // Teardown: anything still queued is dropped, anything still playing is
    // stopped with the stream. The manager joins us after this returns.
    let mut dropped = 0u64;
    while let Ok(cmd) = rx.try_recv() {
        if matches!(cmd, Command::Play(_)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        shared.dropped_requests.fetch_add(dropped, Ordering::Relaxed);
    }

    let stopped = state.voices.len();
    state.voices.clear();
    shared.active_voices.store(0, Ordering::Release);
    shared.bgm_playing.store(false, Ordering::Release);
    if let Ok(mut name) = shared.bgm_name.lock() {
        *name = None;
    }

    log::debug!("audio: worker down (stopped {stopped} voices, dropped {dropped} requests)");
}

/// Returns true on shutdown.
fn handle_command(cmd: Command, state: &mut WorkerState, shared: &Shared) -> bool {
    match cmd {
        Command::InstallSound { name, entry } => {
            if state.sounds.insert(name.clone(), entry).is_some() {
                log::debug!("audio: replaced sound bank entry {name:?}");
            }
        }
        Command::InstallBgm {
            name,
            track,
            volume,
        } => {
            // If the replaced entry was live, the new track takes over from
            // its own start on the next block.
            if state
                .bgm
                .insert(name.clone(), BgmEntry { track, volume })
                .is_some()
            {
                log::debug!("audio: replaced bgm bank entry {name:?}");
            }
        }
        Command::Play(req) => start_voice(state, shared, req),
        Command::PlayBgm { name, volume } => match state.bgm.get_mut(&name) {
            Some(entry) => {
                entry.track.rewind();
                let effective = (entry.volume * volume).clamp(0.0, 1.0);
                shared
                    .bgm_volume_bits
                    .store(effective.to_bits(), Ordering::Release);
                // Switching the slot implicitly stops the previous track:
                // only the current slot is ever mixed.
                state.current_bgm = Some(name.clone());
                if let Ok(mut slot) = shared.bgm_name.lock() {
                    *slot = Some(name);
                }
                shared.bgm_playing.store(true, Ordering::Release);
            }
            None => log::warn!("audio: play_bgm of unregistered track {name:?}"),
        },
        Command::StopBgm => {
            state.current_bgm = None;
            shared.bgm_playing.store(false, Ordering::Release);
            if let Ok(mut slot) = shared.bgm_name.lock() {
                *slot = None;
            }
        }
        Command::NudgeBgmVolume { delta } => {
            if state.current_bgm.is_some() {
                let volume = (shared.bgm_volume() + delta * 0.05).clamp(0.0, 1.0);
                shared
                    .bgm_volume_bits
                    .store(volume.to_bits(), Ordering::Release);
            }
        }
        Command::Shutdown => return true,
    }
    false
}

fn start_voice(state: &mut WorkerState, shared: &Shared, req: PlaybackRequest) {
    let Some(entry) = state.sounds.get(&req.name) else {
        // The façade checks its name registry before enqueueing, so this only
        // happens if the entry failed to install. Fire-and-forget: drop it.
        log::debug!("audio: dropping request for unregistered sound {:?}", req.name);
        shared.dropped_requests.fetch_add(1, Ordering::Relaxed);
        return;
    };

    let spatial = req.position.map(|position| SpatialParams {
        position,
        min_distance: entry.min_distance,
        max_distance: entry.max_distance,
    });

    state.voices.push(Voice {
        sample: entry.sample.clone(),
        frame_pos: 0,
        gain: entry.volume,
        spatial,
    });
    shared.started_voices.fetch_add(1, Ordering::Relaxed);
    shared
        .active_voices
        .store(state.voices.len(), Ordering::Release);
}

/// Poll-driven reclamation: a voice whose cursor has passed its last frame
/// is finished (its tail may still sit in the ring buffer) and is destroyed
/// here, on the owning thread, never from the output callback.
fn reap_finished(state: &mut WorkerState, shared: &Shared) {
    let before = state.voices.len();
    state
        .voices
        .retain(|v| v.frame_pos < v.sample.frames_len());
    let reaped = before - state.voices.len();
    if reaped > 0 {
        shared
            .completed_voices
            .fetch_add(reaped as u64, Ordering::Relaxed);
        shared
            .active_voices
            .store(state.voices.len(), Ordering::Release);
    }
}

fn mix_into(
    prod: &mut impl Producer<Item = f32>,
    state: &mut WorkerState,
    shared: &Shared,
    target_frames: usize,
    channels: usize,
) {
    loop {
        let occupied_frames = prod.occupied_len() / channels;
        if occupied_frames >= target_frames {
            break;
        }
        let frames = (target_frames - occupied_frames).min(MIX_CHUNK_FRAMES);
        let mut out = vec![0.0f32; frames * channels];

        mix_bgm(state, shared, &mut out, channels);
        mix_voices(state, shared, &mut out, frames, channels);

        // Soft clip.
        for s in &mut out {
            *s = s.clamp(-1.0, 1.0);
        }

        let pushed = prod.push_slice(&out);
        if pushed < out.len() {
            // Sized to fit; only reachable if the callback raced us.
            break;
        }
    }
}

fn mix_bgm(state: &mut WorkerState, shared: &Shared, out: &mut [f32], channels: usize) {
    let Some(name) = state.current_bgm.as_ref() else {
        return;
    };
    let Some(entry) = state.bgm.get_mut(name) else {
        return;
    };

    let mut buf = vec![0.0f32; out.len()];
    let got = entry.track.read_looped(&mut buf);
    let volume = shared.bgm_volume();
    for (dst, src) in out.iter_mut().zip(buf[..got * channels].iter()) {
        *dst += *src * volume;
    }
}

fn mix_voices(
    state: &mut WorkerState,
    shared: &Shared,
    out: &mut [f32],
    frames: usize,
    channels: usize,
) {
    let listener = shared.listener();

    for voice in &mut state.voices {
        let available = voice.sample.frames_len().saturating_sub(voice.frame_pos);
        let n = frames.min(available);
        if n == 0 {
            continue;
        }

        // Gains are re-evaluated per block from the latest listener state, so
        // a moving listener affects sounds already in flight.
        let (left_gain, right_gain) = match &voice.spatial {
            Some(sp) => {
                let (l, r) = stereo_gains(&listener, sp.position, sp.min_distance, sp.max_distance);
                (l * voice.gain, r * voice.gain)
            }
            None => (voice.gain, voice.gain),
        };

        let src_start = voice.frame_pos * channels;
        let src = &voice.sample.data[src_start..src_start + n * channels];

        if channels >= 2 {
            for frame in 0..n {
                let base = frame * channels;
                out[base] += src[base] * left_gain;
                out[base + 1] += src[base + 1] * right_gain;
                for c in 2..channels {
                    out[base + c] += src[base + c] * voice.gain;
                }
            }
        } else {
            let gain = 0.5 * (left_gain + right_gain);
            for (dst, s) in out[..n].iter_mut().zip(src.iter()) {
                *dst += *s * gain;
            }
        }

        voice.frame_pos += n;
    }
}

fn drain_all(cons: &mut impl Consumer<Item = f32>) {
    let mut scratch = [0.0f32; 4096];
    while cons.pop_slice(&mut scratch) > 0 {}
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    shared: &Arc<Shared>,
    mut cons: impl Consumer<Item = f32> + Send + 'static,
) -> anyhow::Result<cpal::Stream> {
    use cpal::traits::DeviceTrait;

    let err_fn = |err| log::warn!("audio: stream error: {err}");
    let shared = Arc::clone(shared);

    let mut scratch: Vec<f32> = Vec::new();

    let stream = device
        .build_output_stream_raw(
            config,
            sample_format,
            move |data: &mut cpal::Data, _info| {
                use cpal::Sample;

                let len = data.len();
                scratch.resize(len, 0.0);
                let got = cons.pop_slice(&mut scratch);
                if got < len {
                    for s in &mut scratch[got..] {
                        *s = 0.0;
                    }
                    let prev = shared.underruns.fetch_add(1, Ordering::Relaxed);
                    if prev == 0 {
                        log::warn!("audio: output underrun (queue starved)");
                    }
                }

                match data.sample_format() {
                    cpal::SampleFormat::F32 => {
                        if let Some(out) = data.as_slice_mut::<f32>() {
                            out.copy_from_slice(&scratch);
                        }
                    }
                    cpal::SampleFormat::I16 => {
                        if let Some(out) = data.as_slice_mut::<i16>() {
                            for (dst, src) in out.iter_mut().zip(scratch.iter()) {
                                *dst = i16::from_sample(*src);
                            }
                        }
                    }
                    cpal::SampleFormat::U16 => {
                        if let Some(out) = data.as_slice_mut::<u16>() {
                            for (dst, src) in out.iter_mut().zip(scratch.iter()) {
                                *dst = u16::from_sample(*src);
                            }
                        }
                    }
                    _ => {
                        // Unsupported format: output silence.
                        if let Some(out) = data.as_slice_mut::<f32>() {
                            out.fill(0.0);
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|err| anyhow!("failed to build output stream: {err}"))?;

    Ok(stream)
}
