//! Radix-2 Cooley-Tukey FFT over an interleaved real/imaginary `f32` buffer,
//! plus the filtered-backprojection pre-filter built on top of it.
//!
//! [`fft`] is unnormalised in both directions — a forward transform
//! followed by an inverse transform returns the input scaled by `n`, same
//! as the legacy `Subs::fft`. Callers divide by `n` themselves when they
//! want the inverse to be an exact inverse.

use std::f64::consts::PI;

use crate::array::{Array1, Array2};
use crate::codec::TrailedSpectrum;
use crate::constants::EFAC;
use crate::error::{Error, Result};

fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Smallest power of two `>= n`.
pub fn next_pow2(n: usize) -> usize {
    let mut p = 1usize;
    while p < n {
        p <<= 1;
    }
    p
}

/// In-place radix-2 FFT of `n` complex samples stored interleaved
/// `[re0, im0, re1, im1, ...]` in `buf` (length `2n`). `sign = 1` is the
/// forward transform, `sign = -1` the inverse; neither is normalised.
pub fn fft(buf: &mut [f32], n: usize, sign: i32) -> Result<()> {
    if !is_power_of_two(n) {
        return Err(Error::InputShape(format!(
            "fft length {n} must be a power of two"
        )));
    }
    if buf.len() != 2 * n {
        return Err(Error::InputShape(format!(
            "fft buffer has {} floats, expected {} for n={n}",
            buf.len(),
            2 * n
        )));
    }

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 0..n {
        if i < j {
            buf.swap(2 * i, 2 * j);
            buf.swap(2 * i + 1, 2 * j + 1);
        }
        let mut m = n >> 1;
        while m >= 1 && (j & m) != 0 {
            j &= !m;
            m >>= 1;
        }
        j |= m;
    }

    let sign = if sign >= 0 { 1.0 } else { -1.0 };
    let mut len = 2usize;
    while len <= n {
        let half = len / 2;
        let theta = -sign * 2.0 * PI / len as f64;
        let (wr0, wi0) = (theta.cos(), theta.sin());
        let mut start = 0;
        while start < n {
            let mut wr = 1.0f64;
            let mut wi = 0.0f64;
            for k in 0..half {
                let ie = 2 * (start + k);
                let io = 2 * (start + k + half);
                let er = buf[ie] as f64;
                let ei = buf[ie + 1] as f64;
                let or_ = buf[io] as f64;
                let oi = buf[io + 1] as f64;
                let tr = or_ * wr - oi * wi;
                let ti = or_ * wi + oi * wr;
                buf[ie] = (er + tr) as f32;
                buf[ie + 1] = (ei + ti) as f32;
                buf[io] = (er - tr) as f32;
                buf[io + 1] = (ei - ti) as f32;
                let nwr = wr * wr0 - wi * wi0;
                let nwi = wr * wi0 + wi * wr0;
                wr = nwr;
                wi = nwi;
            }
            start += len;
        }
        len <<= 1;
    }
    Ok(())
}

/// Frequency-domain gain `g[k]`, `k = 0..=nmin/2`, of the filtered-backprojection
/// pre-filter: the FT of `|frequency|` truncated at Nyquist and sampled on
/// the data's period, tapered by a Gaussian noise-suppression window of FWHM
/// `fwhm` cycles/pixel.
fn filter_gain(npix: usize, nmin: usize, fwhm: f32) -> Result<Vec<f64>> {
    let mut kernel = vec![0.0f32; 2 * nmin];
    kernel[0] = 0.25;
    for lag in 1..npix {
        let value = if lag % 2 == 0 {
            0.0
        } else {
            -1.0 / (PI as f32).powi(2) / (lag * lag) as f32
        };
        kernel[2 * lag] = value;
        if nmin - lag != lag {
            kernel[2 * (nmin - lag)] = value;
        }
    }
    fft(&mut kernel, nmin, 1)?;

    let efac = (EFAC as f32 / fwhm).powi(2) / 2.0;
    let mut gain: Vec<f64> = (0..=nmin / 2).map(|k| kernel[2 * k] as f64).collect();
    for (k, g) in gain.iter_mut().enumerate().skip(1) {
        let x = 2.0 * k as f32 / nmin as f32;
        *g *= (-efac * x * x) as f64;
    }
    Ok(gain)
}

/// Apply filtered-backprojection's noise-suppression pre-filter to every
/// spectrum in a trailed spectrum, returning a new trailed spectrum with
/// `data` filtered and `err` left untouched.
pub fn filtered_backprojection(trail: &TrailedSpectrum, fwhm: f32) -> Result<TrailedSpectrum> {
    if fwhm <= 0.0 {
        return Err(Error::InputShape(format!(
            "filter FWHM must be positive, found {fwhm}"
        )));
    }
    let npix = trail.npix();
    let nspec = trail.nspec();
    if npix < 2 {
        return Err(Error::InputShape(format!(
            "filtered backprojection needs Np >= 2, found {npix}"
        )));
    }
    let nmin = next_pow2(2 * npix - 1);
    let gain = filter_gain(npix, nmin, fwhm)?;

    let mut filtered = Array2::<f32>::zeros(nspec, npix);
    for s in 0..nspec {
        let row = trail.data.row(s)?;
        let mut buf = vec![0.0f32; 2 * nmin];
        for (x, &v) in row.iter().enumerate() {
            buf[2 * x] = v;
        }
        fft(&mut buf, nmin, 1)?;
        for k in 0..=nmin / 2 {
            let g = gain[k] as f32;
            buf[2 * k] *= g;
            buf[2 * k + 1] *= g;
            let mirror = nmin - k;
            if mirror != k && mirror < nmin {
                buf[2 * mirror] *= g;
                buf[2 * mirror + 1] *= g;
            }
        }
        fft(&mut buf, nmin, -1)?;
        let out_row = filtered.row_mut(s)?;
        for (x, slot) in out_row.iter_mut().enumerate() {
            *slot = buf[2 * x] / nmin as f32;
        }
    }

    Ok(TrailedSpectrum {
        vpixd: trail.vpixd,
        lambda_d: trail.lambda_d,
        time: Array1::from_vec(trail.time.as_slice().to_vec()),
        expose: Array1::from_vec(trail.expose.as_slice().to_vec()),
        data: filtered,
        err: Array2::from_vec(nspec, npix, trail.err.as_slice().to_vec())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pow2_examples() {
        assert_eq!(next_pow2(1), 1);
        assert_eq!(next_pow2(5), 8);
        assert_eq!(next_pow2(64), 64);
        assert_eq!(next_pow2(65), 128);
    }

    #[test]
    fn fft_rejects_non_power_of_two() {
        let mut buf = vec![0.0f32; 6];
        assert!(fft(&mut buf, 3, 1).is_err());
    }

    #[test]
    fn fft_round_trip_recovers_input_scaled_by_n() {
        let n = 16;
        let original: Vec<f32> = (0..2 * n).map(|i| (i as f32 * 0.37).sin()).collect();
        let mut buf = original.clone();
        fft(&mut buf, n, 1).unwrap();
        fft(&mut buf, n, -1).unwrap();
        for (a, b) in buf.iter().zip(original.iter()) {
            assert!((a - b * n as f32).abs() < 1e-2, "{a} vs {}", b * n as f32);
        }
    }

    #[test]
    fn fft_round_trip_relative_tolerance_across_sizes() {
        for k in 3..=12 {
            let n = 1usize << k;
            let original: Vec<f32> = (0..2 * n).map(|i| (i as f32 * 0.37).sin()).collect();
            let mut buf = original.clone();
            fft(&mut buf, n, 1).unwrap();
            fft(&mut buf, n, -1).unwrap();
            for (a, b) in buf.iter().zip(original.iter()) {
                let expected = b * n as f32;
                let tol = 1e-5 * expected.abs().max(1.0);
                assert!(
                    (a - expected).abs() <= tol,
                    "k={k} n={n}: {a} vs {expected} (tol {tol})"
                );
            }
        }
    }

    #[test]
    fn fft_of_dc_signal_has_energy_only_in_bin_zero() {
        let n = 8;
        let mut buf = vec![0.0f32; 2 * n];
        for i in 0..n {
            buf[2 * i] = 1.0;
        }
        fft(&mut buf, n, 1).unwrap();
        assert!((buf[0] - n as f32).abs() < 1e-4);
        for k in 1..n {
            assert!(buf[2 * k].abs() < 1e-3);
            assert!(buf[2 * k + 1].abs() < 1e-3);
        }
    }

    fn sample_trail(nspec: usize, npix: usize) -> TrailedSpectrum {
        let mut data = Vec::with_capacity(nspec * npix);
        for s in 0..nspec {
            for p in 0..npix {
                data.push(((s * npix + p) as f32 * 0.1).sin() + 2.0);
            }
        }
        TrailedSpectrum {
            vpixd: 40.0,
            lambda_d: 6562.8,
            time: Array1::from_vec(vec![0.0; nspec]),
            expose: Array1::from_vec(vec![0.01; nspec]),
            data: Array2::from_vec(nspec, npix, data).unwrap(),
            err: Array2::from_vec(nspec, npix, vec![1.0; nspec * npix]).unwrap(),
        }
    }

    #[test]
    fn filtered_backprojection_preserves_shape() {
        let trail = sample_trail(3, 20);
        let filtered = filtered_backprojection(&trail, 0.5).unwrap();
        assert_eq!(filtered.nspec(), trail.nspec());
        assert_eq!(filtered.npix(), trail.npix());
        assert_eq!(filtered.err.as_slice(), trail.err.as_slice());
    }

    #[test]
    fn filtered_backprojection_rejects_nonpositive_fwhm() {
        let trail = sample_trail(2, 10);
        assert!(filtered_backprojection(&trail, 0.0).is_err());
    }
}
