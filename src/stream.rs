//! Incremental decoding for background music.
//!
//! BGM tracks run for minutes; decoding them the way one-shot effects are
//! handled would pin tens of megabytes of PCM per track. A [`StreamingTrack`]
//! keeps the symphonia format reader open and pulls packets only as the mix
//! loop consumes frames, converting to the output rate with the same linear
//! interpolation used for one-shot rendering. At end of stream the reader
//! seeks back to the start, so a track installed as BGM loops until stopped.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

pub(crate) struct StreamingTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    out_channels: usize,
    /// Source frames advanced per output frame.
    step: f64,
    /// Fractional read position into `buf`, in frames.
    cursor: f64,
    /// Decoded source-rate frames, already mapped to `out_channels`.
    buf: Vec<f32>,
}

impl StreamingTrack {
    /// Open a track for streaming. Probes the container and sets up the
    /// decoder without pulling any audio yet.
    pub fn open(path: &Path, out_rate: u32, out_channels: usize) -> Option<Self> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("audio: cannot open {}: {err}", path.display());
                return None;
            }
        };

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            hint.with_extension(&ext.to_ascii_lowercase());
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = match symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        ) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("audio: cannot probe {}: {err}", path.display());
                return None;
            }
        };

        let format = probed.format;
        let Some(track) = format.default_track() else {
            log::warn!("audio: no audio track in {}", path.display());
            return None;
        };
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let Some(src_rate) = codec_params.sample_rate else {
            log::warn!("audio: {} is missing a sample rate", path.display());
            return None;
        };

        let decoder =
            match symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default()) {
                Ok(d) => d,
                Err(err) => {
                    log::warn!("audio: no decoder for {}: {err}", path.display());
                    return None;
                }
            };

        Some(Self {
            format,
            decoder,
            track_id,
            out_channels,
            step: f64::from(src_rate) / f64::from(out_rate.max(1)),
            cursor: 0.0,
            buf: Vec::new(),
        })
    }

    /// Seek back to the first frame and drop any buffered audio.
    pub fn rewind(&mut self) {
        let target = SeekTo::Time {
            time: Time::default(),
            track_id: Some(self.track_id),
        };
        if let Err(err) = self.format.seek(SeekMode::Accurate, target) {
            log::warn!("audio: bgm rewind failed: {err}");
        }
        self.decoder.reset();
        self.buf.clear();
        self.cursor = 0.0;
    }

    /// Fill `out` (interleaved, at the output rate) by decoding as needed,
    /// looping back to the start on end of stream. Returns frames written;
    /// short only when the track yields no audio at all, in which case the
    /// remainder is zeroed.
    pub fn read_looped(&mut self, out: &mut [f32]) -> usize {
        let ch = self.out_channels;
        let frames = out.len() / ch;
        let mut rewinds = 0u32;
        let mut written = 0;

        while written < frames {
            let need = self.cursor as usize + 2;
            if self.buffered_frames() < need {
                if self.decode_more() {
                    rewinds = 0;
                    continue;
                }
                // End of stream. Two rewinds without any decoded frames means
                // the track produces nothing; bail instead of spinning.
                rewinds += 1;
                if rewinds >= 2 {
                    break;
                }
                self.rewind();
                continue;
            }

            let i0 = self.cursor as usize;
            let frac = (self.cursor - i0 as f64) as f32;
            for c in 0..ch {
                let s0 = self.buf[i0 * ch + c];
                let s1 = self.buf[(i0 + 1) * ch + c];
                out[written * ch + c] = s0 + (s1 - s0) * frac;
            }
            written += 1;
            self.cursor += self.step;
        }

        for s in &mut out[written * ch..] {
            *s = 0.0;
        }
        self.trim_consumed();
        written
    }

    fn buffered_frames(&self) -> usize {
        self.buf.len() / self.out_channels
    }

    /// Decode the next packet of this track into `buf`. Returns false at end
    /// of stream or on an unrecoverable decode failure.
    fn decode_more(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(_)) => return false,
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    continue;
                }
                Err(err) => {
                    log::warn!("audio: bgm packet read failed: {err}");
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(buf) => buf,
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(SymphoniaError::IoError(_)) => return false,
                Err(err) => {
                    log::warn!("audio: bgm decode failed: {err}");
                    return false;
                }
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let src_ch = spec.channels.count();
            let mut interleaved = SampleBuffer::<f32>::new(frames as u64, spec);
            interleaved.copy_interleaved_ref(decoded);
            let src = interleaved.samples();

            self.buf.reserve(frames * self.out_channels);
            if self.out_channels == 1 && src_ch > 1 {
                for frame in 0..frames {
                    let base = frame * src_ch;
                    let sum: f32 = src[base..base + src_ch].iter().sum();
                    self.buf.push(sum / src_ch as f32);
                }
            } else {
                for frame in 0..frames {
                    let base = frame * src_ch;
                    for c in 0..self.out_channels {
                        self.buf.push(src[base + c.min(src_ch - 1)]);
                    }
                }
            }
            return true;
        }
    }

    /// Drop fully-consumed frames so `buf` stays at roughly one packet.
    fn trim_consumed(&mut self) {
        let whole = (self.cursor as usize).min(self.buffered_frames());
        if whole == 0 {
            return;
        }
        self.buf.drain(..whole * self.out_channels);
        self.cursor -= whole as f64;
    }
}
