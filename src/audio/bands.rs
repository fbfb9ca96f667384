//! # Frequency Band Reduction
//!
//! Maps a linear byte-range magnitude spectrum onto 24 Bark-scale bands for
//! visualization.
//!
//! This is an approximation meant for drawing meters, not an auditory model:
//! each band samples the single linear bin nearest to its centre frequency
//! instead of integrating energy across the band. The centre table is fixed so
//! that output matches other clients of the same protocol exactly.

/// Number of perceptual bands produced by the reducer.
pub const BAND_COUNT: usize = 24;

/// Centre frequencies (Hz) of the 24 Bark critical bands.
pub const BARK_CENTER_FREQUENCIES: [f32; BAND_COUNT] = [
    50.0, 150.0, 250.0, 350.0, 450.0, 570.0, 700.0, 840.0, 1000.0, 1170.0, 1370.0, 1600.0,
    1850.0, 2150.0, 2500.0, 2900.0, 3400.0, 4000.0, 4800.0, 5800.0, 7000.0, 8500.0, 10500.0,
    13500.0,
];

const MIN_MAGNITUDE: f32 = 0.0;
const MAX_MAGNITUDE: f32 = 255.0;

/// Reduce a magnitude spectrum into a new band vector.
pub fn reduce(magnitudes: &[u8], sample_rate: f32) -> [f32; BAND_COUNT] {
    let mut bands = [0.0; BAND_COUNT];
    reduce_into(magnitudes, sample_rate, &mut bands);
    bands
}

/// Reduce a magnitude spectrum into `out` without allocating.
///
/// `magnitudes` holds `N` bins spanning `0..sample_rate / 2`. Bands whose
/// nearest bin falls outside the spectrum are written as 0.
pub fn reduce_into(magnitudes: &[u8], sample_rate: f32, out: &mut [f32; BAND_COUNT]) {
    let bin_count = magnitudes.len();
    if bin_count == 0 || sample_rate <= 0.0 {
        out.fill(0.0);
        return;
    }

    let hz_per_bin = (sample_rate / 2.0) / bin_count as f32;
    for (band, center) in out.iter_mut().zip(BARK_CENTER_FREQUENCIES.iter()) {
        let index = (center / hz_per_bin).round() as usize;
        *band = match magnitudes.get(index) {
            Some(&magnitude) => {
                (magnitude as f32 - MIN_MAGNITUDE) / (MAX_MAGNITUDE - MIN_MAGNITUDE) * 2.0
            }
            None => 0.0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scale_spectrum_maps_to_two() {
        let magnitudes = vec![255u8; 1024];
        let bands = reduce(&magnitudes, 48_000.0);
        assert!(bands.iter().all(|&b| (b - 2.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_nearest_bin_is_sampled() {
        // 1024 bins over 24 kHz → 23.4375 Hz per bin; 1000 Hz → bin 43 (42.67 rounded)
        let mut magnitudes = vec![0u8; 1024];
        magnitudes[43] = 51;
        let bands = reduce(&magnitudes, 48_000.0);
        assert!((bands[8] - 0.4).abs() < 1e-6);
        assert_eq!(bands[7], 0.0);
    }

    #[test]
    fn test_bands_above_nyquist_are_zero() {
        // 8 kHz sample rate: Nyquist at 4 kHz, bands from 4000 Hz up fall outside
        let magnitudes = vec![128u8; 256];
        let bands = reduce(&magnitudes, 8_000.0);
        assert!(bands[16] > 0.0);
        for band in &bands[17..] {
            assert_eq!(*band, 0.0);
        }
    }

    #[test]
    fn test_empty_spectrum() {
        let mut out = [1.0; BAND_COUNT];
        reduce_into(&[], 48_000.0, &mut out);
        assert!(out.iter().all(|&b| b == 0.0));
    }
}
