//! Whole-file decoding for one-shot sound effects.
//!
//! One-shot samples are decoded up front into interleaved f32 at the output
//! stream's rate and channel count, so the mix loop only ever copies slices.
//! Background music goes through [`crate::stream`] instead and is never
//! decoded in full.

use std::sync::Arc;
use std::time::Instant;

use symphonia::core::{
    audio::{AudioBufferRef, SampleBuffer, Signal},
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::bank::SampleData;

/// Planar f32 output of a successful decode: `samples[channel][frame]`.
pub(crate) struct DecodedAudio {
    pub sample_rate: u32,
    pub samples: Vec<Vec<f32>>,
}

/// Decode `bytes` and convert to the output stream's rate and channel count.
/// Failures are logged against `label` and absorbed into `None`; a missing
/// or corrupt asset must never take the game down.
pub(crate) fn render_sample(
    bytes: Vec<u8>,
    target_rate: u32,
    target_channels: usize,
    hint_ext: Option<&str>,
    label: &str,
) -> Option<SampleData> {
    let t0 = Instant::now();
    let decoded = decode_bytes(bytes, hint_ext, label)?;

    let src_rate = decoded.sample_rate.max(1);
    let planar = map_channels(decoded.samples, target_channels);

    let ratio = f64::from(target_rate) / f64::from(src_rate);
    let planar = if (ratio - 1.0).abs() <= 1e-9 {
        planar
    } else {
        resample_planar(&planar, ratio)?
    };

    let frames = planar[0].len();
    let mut data = Vec::with_capacity(frames * target_channels);
    for i in 0..frames {
        for plane in planar.iter() {
            data.push(plane[i]);
        }
    }

    log::debug!(
        "audio: rendered {label:?} ({frames} frames at {target_rate} Hz, {:.2}s)",
        t0.elapsed().as_secs_f64()
    );

    Some(SampleData {
        sample_rate: target_rate,
        channels: target_channels,
        data: Arc::new(data),
    })
}

pub(crate) fn decode_bytes(
    bytes: Vec<u8>,
    hint_ext: Option<&str>,
    label: &str,
) -> Option<DecodedAudio> {
    let ext = hint_ext
        .map(|e| e.trim().trim_start_matches('.'))
        .filter(|e| !e.is_empty());

    let probe = symphonia::default::get_probe();
    let make_stream = |bytes: Vec<u8>| {
        MediaSourceStream::new(Box::new(std::io::Cursor::new(bytes)), Default::default())
    };

    let mut hint = Hint::new();
    if let Some(ext) = ext {
        hint.with_extension(ext);
    }

    let probed = match probe.format(
        &hint,
        make_stream(bytes.clone()),
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(p) => p,
        Err(err) if ext.is_some() => {
            // A wrong extension hint shouldn't doom an otherwise decodable file.
            log::debug!("audio: probe of {label:?} failed with hint {ext:?} ({err}), retrying");
            match probe.format(
                &Hint::new(),
                make_stream(bytes),
                &FormatOptions::default(),
                &MetadataOptions::default(),
            ) {
                Ok(p) => p,
                Err(err) => {
                    log::warn!("audio: cannot probe {label:?}: {err}");
                    return None;
                }
            }
        }
        Err(err) => {
            log::warn!("audio: cannot probe {label:?}: {err}");
            return None;
        }
    };

    let mut format = probed.format;

    let Some(track) = format.default_track() else {
        log::warn!("audio: {label:?} has no default audio track");
        return None;
    };
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let Some(sample_rate) = codec_params.sample_rate else {
        log::warn!("audio: {label:?} is missing a sample rate");
        return None;
    };
    let Some(channels) = codec_params.channels.map(|ch| ch.count()) else {
        log::warn!("audio: {label:?} is missing a channel count");
        return None;
    };

    let mut decoder =
        match symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default()) {
            Ok(d) => d,
            Err(err) => {
                log::warn!("audio: no decoder for {label:?}: {err}");
                return None;
            }
        };

    let mut samples: Vec<Vec<f32>> = (0..channels).map(|_| Vec::new()).collect();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => {
                log::warn!("audio: failed reading packet of {label:?}: {err}");
                return None;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(buf) => buf,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => {
                log::warn!("audio: decode error in {label:?}: {err}");
                return None;
            }
        };

        match decoded {
            AudioBufferRef::F32(buf) => {
                let ch = buf.spec().channels.count();
                let frames = buf.frames();
                if ch != channels {
                    log::warn!("audio: channel count changed mid-stream in {label:?}");
                    return None;
                }
                for (c, plane) in samples.iter_mut().enumerate() {
                    plane.extend_from_slice(&buf.chan(c)[..frames]);
                }
            }
            other => {
                let spec = *other.spec();
                let frames = other.frames();
                if spec.channels.count() != channels {
                    log::warn!("audio: channel count changed mid-stream in {label:?}");
                    return None;
                }

                let mut sb = SampleBuffer::<f32>::new(frames as u64, spec);
                sb.copy_interleaved_ref(other);
                let interleaved = sb.samples();
                for frame in 0..frames {
                    for (c, plane) in samples.iter_mut().enumerate() {
                        plane.push(interleaved[frame * channels + c]);
                    }
                }
            }
        }
    }

    if samples.is_empty() || samples[0].is_empty() {
        log::warn!("audio: {label:?} decoded to no audio");
        return None;
    }

    Some(DecodedAudio {
        sample_rate,
        samples,
    })
}

fn map_channels(src: Vec<Vec<f32>>, target: usize) -> Vec<Vec<f32>> {
    let src_ch = src.len();
    if src_ch == target {
        return src;
    }

    if target == 1 {
        let frames = src[0].len();
        let mut mono = Vec::with_capacity(frames);
        for i in 0..frames {
            let sum: f32 = src.iter().map(|plane| plane[i]).sum();
            mono.push(sum / src_ch as f32);
        }
        return vec![mono];
    }

    // Upmix by duplicating the last source channel into the extra slots.
    (0..target)
        .map(|c| src[c.min(src_ch - 1)].clone())
        .collect()
}

/// Linear sample-rate conversion. Lower quality than a windowed-sinc
/// resampler, but load-time conversion of short effects must not stall the
/// level load for seconds.
fn resample_planar(input: &[Vec<f32>], ratio: f64) -> Option<Vec<Vec<f32>>> {
    if !ratio.is_finite() || ratio <= 0.0 {
        log::warn!("audio: invalid resample ratio {ratio}");
        return None;
    }

    let frames_in = input[0].len();
    if frames_in == 0 {
        return None;
    }

    let frames_out = ((frames_in as f64) * ratio).ceil().max(1.0) as usize;
    let inv_ratio = 1.0 / ratio;

    let mut out: Vec<Vec<f32>> = Vec::with_capacity(input.len());
    for src in input {
        let mut dst = Vec::with_capacity(frames_out);
        for i in 0..frames_out {
            let src_pos = (i as f64) * inv_ratio;
            let idx0 = (src_pos.floor() as usize).min(frames_in - 1);
            let idx1 = (idx0 + 1).min(frames_in - 1);
            let frac = (src_pos - idx0 as f64) as f32;

            let s0 = src[idx0];
            let s1 = src[idx1];
            dst.push(s0 + (s1 - s0) * frac);
        }
        out.push(dst);
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testwav;

    #[test]
    fn renders_mono_wav_to_stereo_at_device_rate() {
        let bytes = testwav::wav_bytes(22_050, 500, 0.5);
        let sample = render_sample(bytes, 44_100, 2, Some("wav"), "fixture").unwrap();

        assert_eq!(sample.channels, 2);
        // Rate doubling roughly doubles the frame count.
        let frames = sample.frames_len();
        assert!((995..=1005).contains(&frames), "frames = {frames}");
        // Mono upmix: both channels carry the same signal.
        assert_eq!(sample.data[0], sample.data[1]);
        assert!((sample.data[0] - 0.5).abs() < 0.01);
    }

    #[test]
    fn bad_extension_hint_still_decodes() {
        let bytes = testwav::wav_bytes(44_100, 100, 0.25);
        let sample = render_sample(bytes, 44_100, 2, Some("mp3"), "fixture").unwrap();
        assert_eq!(sample.frames_len(), 100);
    }

    #[test]
    fn garbage_bytes_are_absorbed() {
        assert!(render_sample(vec![0u8; 64], 44_100, 2, None, "garbage").is_none());
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let input = vec![vec![0.25f32; 100]];
        let out = resample_planar(&input, 2.0).unwrap();
        assert_eq!(out[0].len(), 200);
        assert!(out[0].iter().all(|s| (s - 0.25).abs() < 1e-6));
    }
}
