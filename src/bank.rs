use std::sync::Arc;

/// Fallback spatial falloff for bank entries loaded with unusable distances.
pub(crate) const DEFAULT_MIN_DISTANCE: f32 = 1.0;
pub(crate) const DEFAULT_MAX_DISTANCE: f32 = 100.0;

/// Decoded PCM, interleaved f32 at the output stream's rate and channel
/// count. Cloning shares the underlying buffer, so spawning a playing
/// instance from a template never copies sample data.
#[derive(Clone)]
pub(crate) struct SampleData {
    pub sample_rate: u32,
    pub channels: usize,
    pub data: Arc<Vec<f32>>,
}

impl SampleData {
    pub fn frames_len(&self) -> usize {
        self.data.len() / self.channels
    }
}

/// A named one-shot template: fully decoded audio plus the spatial falloff
/// and base volume every spawned instance starts from. The template itself
/// is never played; `play`/`play_3d` spawn an independent voice from it.
pub(crate) struct BankEntry {
    pub sample: SampleData,
    pub min_distance: f32,
    pub max_distance: f32,
    pub volume: f32,
}

impl BankEntry {
    pub fn new(sample: SampleData, min_distance: f32, max_distance: f32, volume: f32) -> Self {
        let (min_distance, max_distance) = if min_distance.is_finite()
            && max_distance.is_finite()
            && min_distance > 0.0
            && max_distance > min_distance
        {
            (min_distance, max_distance)
        } else {
            log::warn!(
                "audio: unusable falloff distances ({min_distance}, {max_distance}), using defaults"
            );
            (DEFAULT_MIN_DISTANCE, DEFAULT_MAX_DISTANCE)
        };

        let volume = if volume.is_finite() { volume.max(0.0) } else { 1.0 };

        Self {
            sample,
            min_distance,
            max_distance,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleData {
        SampleData {
            sample_rate: 44_100,
            channels: 2,
            data: Arc::new(vec![0.0; 64]),
        }
    }

    #[test]
    fn inverted_distances_fall_back_to_defaults() {
        let entry = BankEntry::new(sample(), 20.0, 5.0, 1.0);
        assert_eq!(entry.min_distance, DEFAULT_MIN_DISTANCE);
        assert_eq!(entry.max_distance, DEFAULT_MAX_DISTANCE);
    }

    #[test]
    fn negative_volume_is_clamped() {
        let entry = BankEntry::new(sample(), 1.0, 10.0, -0.5);
        assert_eq!(entry.volume, 0.0);
    }

    #[test]
    fn frames_len_counts_frames_not_samples() {
        assert_eq!(sample().frames_len(), 32);
    }
}
