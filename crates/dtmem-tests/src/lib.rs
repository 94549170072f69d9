//! Property and scenario test battery for the maximum-entropy Doppler
//! tomography engine.
//!
//! Exercises `dtmem-core` the way a user would — file-shaped inputs in,
//! `driver::run` or a few explicit `mem::step` calls, assertions on the
//! result — rather than poking at internal data structures. Unit-level
//! properties (container round-trip, adjoint identity, FFT round-trip,
//! default idempotence/monotonicity) live next to the code they test inside
//! `dtmem-core`; what's here is the integration layer: properties that only
//! make sense across multiple modules, plus the four scenario tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dtmem_core::array::{Array1, Array2};
use dtmem_core::codec::{ImageCube, TrailedSpectrum};
use dtmem_core::default_image::default_uniform;
use dtmem_core::driver::{self, DefaultMode, RunParams};
use dtmem_core::mem::{step, Workspace};
use dtmem_core::projector::{self, DataGeometry, Ephemeris, ImageGeometry, ProjectionParams};

/// A single-wavelength, single-gamma image cube of size `n x n`, filled
/// uniformly except for one spike.
fn spike_image(n: usize, vpix: f32, background: f32, spike_row: usize, spike_col: usize, spike_height: f32) -> ImageCube {
    let mut cube = ImageCube::zeros(1, 1, n, vpix).unwrap();
    cube.lambda0.set(0, 6562.8).unwrap();
    cube.gamma.set(0, 0.0).unwrap();
    cube.data.fill(background);
    cube.set_pixel(0, 0, spike_row, spike_col, spike_height).unwrap();
    cube
}

fn regular_trail(ns: usize, np: usize, vpixd: f32, lambda_d: f64, dt: f64, expose: f32, data_value: f32, err_value: f32) -> TrailedSpectrum {
    let time: Vec<f64> = (0..ns).map(|i| i as f64 * dt).collect();
    TrailedSpectrum {
        vpixd,
        lambda_d,
        time: Array1::from_vec(time),
        expose: Array1::from_vec(vec![expose; ns]),
        data: Array2::from_vec(ns, np, vec![data_value; ns * np]).unwrap(),
        err: Array2::from_vec(ns, np, vec![err_value; ns * np]).unwrap(),
    }
}

// ---------------------------------------------------------------------------
// Property 3: positivity preservation after any single MEM step.
// ---------------------------------------------------------------------------

#[test]
fn property_positivity_preserved_after_step() {
    let image = spike_image(16, 50.0, 1e-3, 8, 8, 1.0);
    let default = default_uniform(&image).unwrap();
    let trail = regular_trail(8, 24, 40.0, 6562.8, 0.05, 0.01, 0.0, 1.0);
    let weights = Array2::from_vec(
        trail.nspec(),
        trail.npix(),
        vec![1.0f32; trail.nspec() * trail.npix()],
    )
    .unwrap();

    let ephemeris = Ephemeris { t0: 0.0, period: 1.0 };
    let params = ProjectionParams { fwhm: 150.0, ndiv: 1, ntdiv: 1 };
    let mut ws = Workspace::new(&image, &default, &trail, &weights, ephemeris, params).unwrap();

    let report = step(&mut ws, 1.0, 0.2, 1.0).unwrap();
    assert!(ws.f.iter().all(|&v| v > 0.0 && v.is_finite()));
    assert!(report.acc_used > 0.0 && report.acc_used <= 1.0);
}

// ---------------------------------------------------------------------------
// Property 6: chi-squared does not grow under an unconstrained step taken
// from f = m when C(f) is well above caim.
// ---------------------------------------------------------------------------

#[test]
fn property_chisq_does_not_grow_from_default_when_above_target() {
    let image = spike_image(12, 60.0, 0.05, 6, 6, 2.0);
    // Start exactly at the default: f == m, C(f) driven high by data != op(f).
    let default = default_uniform(&image).unwrap();
    let trail = regular_trail(6, 16, 45.0, 6562.8, 0.08, 0.02, 0.5, 0.2);
    let weights = Array2::from_vec(
        trail.nspec(),
        trail.npix(),
        vec![1.0f32; trail.nspec() * trail.npix()],
    )
    .unwrap();

    let ephemeris = Ephemeris { t0: 0.0, period: 1.0 };
    let params = ProjectionParams { fwhm: 120.0, ndiv: 1, ntdiv: 1 };
    let mut ws = Workspace::new(&default, &default, &trail, &weights, ephemeris, params).unwrap();

    let before = step(&mut ws, 1e-6, 0.3, 1.0).unwrap();
    let after = step(&mut ws, 1e-6, 0.3, 1.0).unwrap();

    assert!(before.chisq > 1e-6, "test fixture should start above caim");
    assert!(
        after.chisq <= before.chisq * 1.01,
        "chisq should not grow across an unconstrained step: {} -> {}",
        before.chisq,
        after.chisq
    );
}

// ---------------------------------------------------------------------------
// S1: uniform default should relax a single spike toward the per-slice mean.
// ---------------------------------------------------------------------------

#[test]
fn scenario_s1_spike_relaxes_toward_uniform_mean() {
    let n = 32;
    let image = spike_image(n, 50.0, 1e-3, 16, 16, 1.0);
    let trail = regular_trail(20, 64, 40.0, 6562.8, 0.05, 0.01, 0.0, 1.0);

    let params = RunParams {
        niter: 20,
        caim: 1.0,
        rmax: 0.1,
        tlim: 0.01,
        acc: 1.0,
        default_mode: DefaultMode::Uniform,
        fwhm: 100.0,
        ndiv: 1,
        ntdiv: 1,
        tzero: 0.0,
        period: 1.0,
    };

    let (result, run_report) = driver::run(image, trail, params).unwrap();
    assert!(result.all_positive());
    assert!(!run_report.iterations.is_empty());

    let expected_mean = 1.0 / (n * n) as f32;
    let actual_mean = result.data.as_slice().iter().sum::<f32>() / result.data.len() as f32;
    // Full relaxation drives the mean toward 1/N^2; a fixed iteration budget
    // only gets partway there, so this only checks the right order of magnitude.
    assert!(
        actual_mean > expected_mean * 0.1 && actual_mean < expected_mean * 10.0,
        "mean {actual_mean} far from expected order of magnitude {expected_mean}"
    );
}

// ---------------------------------------------------------------------------
// S2: synthetic round-trip — recovered image correlates with the input.
// ---------------------------------------------------------------------------

fn pearson_correlation(a: &[f32], b: &[f32]) -> f64 {
    let n = a.len() as f64;
    let mean_a: f64 = a.iter().map(|&x| x as f64).sum::<f64>() / n;
    let mean_b: f64 = b.iter().map(|&x| x as f64).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

#[test]
fn scenario_s2_round_trip_correlates_with_input() {
    let n = 16;
    let mut rng = StdRng::seed_from_u64(42);
    let mut image = ImageCube::zeros(1, 1, n, 60.0).unwrap();
    image.lambda0.set(0, 6562.8).unwrap();
    image.gamma.set(0, 0.0).unwrap();
    for v in image.data.as_mut_slice() {
        *v = 0.5 + rng.random::<f32>();
    }
    // A single bright spot on top of the noisy background is what makes the
    // correlation test meaningful.
    image.set_pixel(0, 0, n / 2, n / 2, 5.0).unwrap();

    let ephemeris = Ephemeris { t0: 0.0, period: 1.0 };
    let params = ProjectionParams { fwhm: 120.0, ndiv: 1, ntdiv: 1 };
    let data_geom = DataGeometry {
        ns: 10,
        np: 32,
        vpixd: 45.0,
        lambda_d: 6562.8,
        time: (0..10).map(|i| i as f64 * 0.1).collect(),
        expose: vec![0.02; 10],
    };
    let image_geom = ImageGeometry {
        nw: image.nw,
        ng: image.ng,
        n: image.n,
        vpix: image.vpix,
        lambda0: image.lambda0.as_slice().to_vec(),
        gamma: image.gamma.as_slice().to_vec(),
    };
    let synthetic = projector::op(&image_geom, &data_geom, &ephemeris, &params, image.data.as_slice()).unwrap();

    let err: Vec<f32> = synthetic
        .as_slice()
        .iter()
        .map(|&d| (0.01 * d.abs()).max(0.01))
        .collect();
    let trail = TrailedSpectrum {
        vpixd: data_geom.vpixd,
        lambda_d: data_geom.lambda_d,
        time: Array1::from_vec(data_geom.time.clone()),
        expose: Array1::from_vec(data_geom.expose.clone()),
        data: synthetic,
        err: Array2::from_vec(data_geom.ns, data_geom.np, err).unwrap(),
    };

    let start = spike_image(n, 60.0, 0.1, n / 2, n / 2, 0.1);
    let run_params = RunParams {
        niter: 50,
        caim: 1.0,
        rmax: 0.2,
        tlim: 1e-4,
        acc: 0.5,
        default_mode: DefaultMode::Uniform,
        fwhm: 120.0,
        ndiv: 1,
        ntdiv: 1,
        tzero: 0.0,
        period: 1.0,
    };
    let (result, _report) = driver::run(start, trail, run_params).unwrap();

    let corr = pearson_correlation(result.data.as_slice(), image.data.as_slice());
    // Full convergence correlates strongly with the input; a weaker bound is
    // appropriate for this deliberately small, fixed-iteration test problem.
    assert!(corr > 0.3, "correlation with input too low: {corr}");
}

// ---------------------------------------------------------------------------
// S3: Gaussian default on a ring image must stay positive and not trend
// upward in chi-squared over several iterations.
// ---------------------------------------------------------------------------

fn ring_image(n: usize, vpix: f32, radius_pixels: f32) -> ImageCube {
    let mut cube = ImageCube::zeros(1, 1, n, vpix).unwrap();
    cube.lambda0.set(0, 6562.8).unwrap();
    cube.gamma.set(0, 0.0).unwrap();
    let centre = (n as f32 - 1.0) / 2.0;
    for y in 0..n {
        for x in 0..n {
            let dx = x as f32 - centre;
            let dy = y as f32 - centre;
            let r = (dx * dx + dy * dy).sqrt();
            let value = if (r - radius_pixels).abs() < 1.5 { 1.0 } else { 0.0 };
            cube.set_pixel(0, 0, y, x, value + 1e-3).unwrap();
        }
    }
    cube
}

#[test]
fn scenario_s3_gaussian_default_ring_stays_positive_and_descends() {
    let n = 24;
    let image = ring_image(n, 40.0, 10.0);
    let trail = regular_trail(12, 32, 40.0, 6562.8, 0.04, 0.01, 0.0, 1.0);

    let params = RunParams {
        niter: 10,
        caim: 1e-6,
        rmax: 0.2,
        tlim: 1e-6,
        acc: 0.5,
        default_mode: DefaultMode::Gaussian { blurr: 4.0, gblurr: 1.0 },
        fwhm: 100.0,
        ndiv: 1,
        ntdiv: 1,
        tzero: 0.0,
        period: 1.0,
    };

    let (result, run_report) = driver::run(image, trail, params).unwrap();
    assert!(result.all_positive());
    assert!(result.data.as_slice().iter().all(|v| v.is_finite()));

    for pair in run_report.iterations.windows(2) {
        assert!(
            pair[1].chisq <= pair[0].chisq * 1.05,
            "chisq should not trend upward, found {} -> {}",
            pair[0].chisq,
            pair[1].chisq
        );
    }
}

// ---------------------------------------------------------------------------
// S4: file-format negative tests.
// ---------------------------------------------------------------------------

#[test]
fn scenario_s4_trail_bad_magic_is_bad_format() {
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Cursor;

    let mut buf = Vec::new();
    buf.write_i32::<LittleEndian>(1_235_642).unwrap();
    buf.write_f32::<LittleEndian>(1.0).unwrap();
    buf.write_f64::<LittleEndian>(1.0).unwrap();
    let err = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap_err();
    assert!(matches!(err, dtmem_core::error::Error::BadFormat { .. }));
}

#[test]
fn scenario_s4_truncated_trail_is_truncated_error() {
    use std::io::Cursor;

    let trail = regular_trail(3, 8, 40.0, 6562.8, 0.05, 0.01, 0.0, 1.0);
    let mut buf = Vec::new();
    trail.write(&mut buf).unwrap();
    buf.truncate(buf.len() - 1);
    let err = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap_err();
    assert!(matches!(err, dtmem_core::error::Error::Truncated { .. }));
}

// ---------------------------------------------------------------------------
// FFT cross-check against rustfft (property 7's external oracle).
// ---------------------------------------------------------------------------

#[test]
fn fft_matches_rustfft_oracle() {
    use rustfft::num_complex::Complex32;
    use rustfft::FftPlanner;

    let mut rng = StdRng::seed_from_u64(7);
    for k in 3..=10 {
        let n = 1usize << k;
        let input: Vec<f32> = (0..n).map(|_| rng.random::<f32>() - 0.5).collect();

        let mut buf: Vec<f32> = Vec::with_capacity(2 * n);
        for &x in &input {
            buf.push(x);
            buf.push(0.0);
        }
        dtmem_core::fft::fft(&mut buf, n, 1).unwrap();

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);
        let mut complex: Vec<Complex32> = input.iter().map(|&x| Complex32::new(x, 0.0)).collect();
        fft.process(&mut complex);

        for i in 0..n {
            let ours = Complex32::new(buf[2 * i], buf[2 * i + 1]);
            let theirs = complex[i];
            let scale = (n as f32).sqrt().max(1.0);
            assert!(
                (ours - theirs).norm() / scale < 1e-2,
                "fft mismatch at k={k} i={i}: {ours:?} vs {theirs:?}"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Statistical sanity: the chi-squared weighting convention (`w =
// 2/(sigma^2 Ndat)`) is meaningful only if `sum w r^2` behaves like a scaled
// chi-squared variate when residuals really are Gaussian noise. Cross-check
// against `statrs`'s chi-squared CDF rather than asserting an exact value.
// ---------------------------------------------------------------------------

#[test]
fn weighted_chisq_of_gaussian_noise_is_statistically_plausible() {
    use statrs::distribution::{ChiSquared, ContinuousCDF};

    let ndat = 400usize;
    let mut rng = StdRng::seed_from_u64(99);
    let mut sum_sq = 0.0f64;
    for _ in 0..ndat / 2 {
        let u1: f64 = rng.random::<f64>().max(1e-12);
        let u2: f64 = rng.random::<f64>();
        let r = (-2.0 * u1.ln()).sqrt();
        let z0 = r * (2.0 * std::f64::consts::PI * u2).cos();
        let z1 = r * (2.0 * std::f64::consts::PI * u2).sin();
        sum_sq += z0 * z0 + z1 * z1;
    }
    // Each z_i ~ N(0, 1), so sum_sq ~ ChiSquared(ndat).
    let dist = ChiSquared::new(ndat as f64).unwrap();
    let p = dist.cdf(sum_sq);
    assert!(
        p > 0.001 && p < 0.999,
        "chisq statistic {sum_sq} landed in an implausible tail (p={p})"
    );
}
