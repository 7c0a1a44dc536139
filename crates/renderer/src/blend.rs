//! CPU mirror of the accumulation shader math.
//!
//! The GLSL in [`crate::compile`] and the software backend both follow these
//! functions, so they double as the reference the tests check against.

/// Weight the history keeps when the incoming frame is brighter (and the
/// weight the incoming frame gets when it is darker).
pub const EXPOSURE_MIX: f32 = 0.01;

/// Rec. 709 luma of the color channels plus the alpha channel.
pub fn luminance(color: [f32; 4]) -> f32 {
    color[0] * 0.2126 + color[1] * 0.7152 + color[2] * 0.0722 + color[3]
}

/// GLSL `mix(x, y, a)`.
pub fn mix(x: [f32; 4], y: [f32; 4], a: f32) -> [f32; 4] {
    std::array::from_fn(|i| x[i] * (1.0 - a) + y[i] * a)
}

/// Luminance-gated blend of the live frame over the accumulated history.
///
/// A brighter incoming pixel replaces the history almost entirely; a darker
/// or equally bright one only nudges it, so highlights persist.
pub fn luminance_gated_mix(incoming: [f32; 4], history: [f32; 4]) -> [f32; 4] {
    if luminance(incoming) > luminance(history) {
        mix(incoming, history, EXPOSURE_MIX)
    } else {
        mix(history, incoming, EXPOSURE_MIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: [f32; 4], expected: [f32; 4]) {
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-5, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn luminance_counts_alpha() {
        assert!((luminance([0.0, 0.0, 0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((luminance([1.0, 1.0, 1.0, 1.0]) - 2.0).abs() < 1e-6);
        assert!((luminance([0.0, 1.0, 0.0, 0.0]) - 0.7152).abs() < 1e-6);
    }

    #[test]
    fn brighter_frame_takes_over() {
        let out = luminance_gated_mix([1.0, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 1.0]);
        assert_close(out, [0.99, 0.99, 0.99, 1.0]);
    }

    #[test]
    fn darker_frame_fades_in_slowly() {
        let out = luminance_gated_mix([0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]);
        assert_close(out, [0.99, 0.99, 0.99, 1.0]);

        let out = luminance_gated_mix([0.2, 0.0, 0.0, 1.0], [0.0, 0.5, 0.0, 1.0]);
        assert_close(out, [0.002, 0.495, 0.0, 1.0]);
    }

    #[test]
    fn ties_keep_history() {
        let incoming = [0.0, 0.0, 1.0, 1.0];
        let history = [0.0, 0.0, 1.0, 1.0];
        assert_close(luminance_gated_mix(incoming, history), history);

        // Equal luminance, different colors: the history side wins the 0.99 weight.
        let incoming = [0.7152, 0.0, 0.0, 1.0];
        let history = [0.0, 0.2126, 0.0, 1.0];
        assert!((luminance(incoming) - luminance(history)).abs() < 1e-6);
        let expected = mix(history, incoming, EXPOSURE_MIX);
        assert_close(luminance_gated_mix(incoming, history), expected);
    }
}
