//! Listener-relative attenuation and stereo panning.
//!
//! Each mixed block re-evaluates these gains from the latest listener state,
//! so sounds track a moving listener without being restarted. Attenuation is
//! linear between a source's min and max distance; panning is constant-power
//! from the azimuth of the source relative to the listener's facing.

use std::f32::consts::FRAC_PI_4;

const WORLD_UP: [f32; 3] = [0.0, 1.0, 0.0];

/// Listener position and facing, published once per frame by the game loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Listener {
    pub position: [f32; 3],
    pub forward: [f32; 3],
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            forward: [0.0, 0.0, -1.0],
        }
    }
}

fn sub(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f32; 3], b: [f32; 3]) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn length(v: [f32; 3]) -> f32 {
    dot(v, v).sqrt()
}

/// Stereo gains for a spatialized source. Both gains are zero beyond
/// `max_distance`; inside `min_distance` only panning applies.
pub(crate) fn stereo_gains(
    listener: &Listener,
    source: [f32; 3],
    min_distance: f32,
    max_distance: f32,
) -> (f32, f32) {
    let delta = sub(source, listener.position);
    let distance = length(delta);

    let attenuation = if distance <= min_distance {
        1.0
    } else if distance >= max_distance {
        0.0
    } else {
        1.0 - (distance - min_distance) / (max_distance - min_distance)
    };

    if attenuation <= 0.0 {
        return (0.0, 0.0);
    }

    // Pan from the source azimuth relative to the listener's facing. A
    // vertical facing vector has no meaningful right axis; fall back to +x.
    let right = cross(listener.forward, WORLD_UP);
    let right_len = length(right);
    let right = if right_len > 1e-6 {
        [right[0] / right_len, right[1] / right_len, right[2] / right_len]
    } else {
        [1.0, 0.0, 0.0]
    };

    let pan = if distance > 1e-6 {
        (dot(delta, right) / distance).clamp(-1.0, 1.0)
    } else {
        0.0
    };

    // Constant-power: equal loudness when centered, full swing at the sides.
    let angle = (pan + 1.0) * FRAC_PI_4;
    (attenuation * angle.cos(), attenuation * angle.sin())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-4;

    #[test]
    fn centered_source_is_balanced() {
        let listener = Listener::default();
        let (l, r) = stereo_gains(&listener, [0.0, 0.0, -0.5], 1.0, 10.0);
        assert!((l - r).abs() < EPS);
        assert!((l - FRAC_PI_4.cos()).abs() < EPS);
    }

    #[test]
    fn source_to_the_right_favors_right_channel() {
        let listener = Listener::default();
        let (l, r) = stereo_gains(&listener, [0.5, 0.0, 0.0], 1.0, 10.0);
        assert!(r > l);
    }

    #[test]
    fn facing_flips_the_pan() {
        // Facing +z, world +x is now on the listener's left.
        let listener = Listener {
            position: [0.0; 3],
            forward: [0.0, 0.0, 1.0],
        };
        let (l, r) = stereo_gains(&listener, [0.5, 0.0, 0.0], 1.0, 10.0);
        assert!(l > r);
    }

    #[test]
    fn silent_beyond_max_distance() {
        let listener = Listener::default();
        let (l, r) = stereo_gains(&listener, [0.0, 0.0, 50.0], 1.0, 10.0);
        assert_eq!((l, r), (0.0, 0.0));
    }

    #[test]
    fn attenuation_fades_between_min_and_max() {
        let listener = Listener::default();
        let (near_l, near_r) = stereo_gains(&listener, [0.0, 0.0, 2.0], 1.0, 11.0);
        let (far_l, far_r) = stereo_gains(&listener, [0.0, 0.0, 10.0], 1.0, 11.0);
        assert!(near_l + near_r > far_l + far_r);
        assert!(far_l > 0.0);
    }

    #[test]
    fn vertical_facing_does_not_produce_nan() {
        let listener = Listener {
            position: [0.0; 3],
            forward: [0.0, 1.0, 0.0],
        };
        let (l, r) = stereo_gains(&listener, [1.0, 0.0, 0.0], 1.0, 10.0);
        assert!(l.is_finite() && r.is_finite());
        assert!(r > l);
    }
}
