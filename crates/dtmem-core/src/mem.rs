//! The constrained quadratic-subspace entropy maximiser.
//!
//! [`Workspace`] owns the current image `f`, the default image `m`, the
//! measured data `d` and its weights `w` — a typed, owned replacement for
//! the legacy global float buffer and its labelled-slot table. [`step`]
//! performs one MEMSYS-style iteration: build three search directions in
//! the entropy metric, map them into data space, solve the resulting 3×3
//! constrained quadratic subproblem for a Lagrange multiplier that respects
//! the trust region, and apply the step with automatic `acc` back-off if it
//! would drive a voxel non-positive.

use log::{debug, trace};

use crate::array::{Array1, Array2, Array3};
use crate::codec::{ImageCube, TrailedSpectrum};
use crate::error::{Error, Result};
use crate::projector::{op, tr, DataGeometry, Ephemeris, ImageGeometry, ProjectionParams};

/// Everything one MEM step needs: geometry, the current/default images, and
/// the weighted data.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub image_geom: ImageGeometry,
    pub data_geom: DataGeometry,
    pub ephemeris: Ephemeris,
    pub params: ProjectionParams,
    /// Current image, flattened `(w, g, y, x)` row-major.
    pub f: Vec<f32>,
    /// Default image, same layout as `f`.
    pub m: Vec<f32>,
    /// Measured data, flattened `(s, p)` row-major.
    pub d: Vec<f32>,
    /// Per-datum weight; values `<= 0` are treated as unweighted (masked).
    pub w: Vec<f32>,
}

/// Outcome of one [`step`] call, for the driver to log and test for
/// convergence against `tlim`/`caim`.
#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    pub entropy: f32,
    pub chisq: f32,
    /// Cosine of the angle between `∇S` and `∇C` in the entropy metric.
    pub test: f32,
    /// The `acc` actually applied, after any automatic back-off.
    pub acc_used: f32,
}

impl Workspace {
    pub fn new(
        image: &ImageCube,
        default: &ImageCube,
        data: &TrailedSpectrum,
        weights: &Array2<f32>,
        ephemeris: Ephemeris,
        params: ProjectionParams,
    ) -> Result<Self> {
        if image.nw != default.nw || image.ng != default.ng || image.n != default.n {
            return Err(Error::InputShape(format!(
                "image ({}, {}, {}) and default image ({}, {}, {}) shapes differ",
                image.nw, image.ng, image.n, default.nw, default.ng, default.n
            )));
        }
        if !weights.shape_matches(&data.data) {
            return Err(Error::InputShape(format!(
                "weights is {}x{}, data is {}x{}",
                weights.rows(),
                weights.cols(),
                data.data.rows(),
                data.data.cols()
            )));
        }
        if !image.all_positive() {
            return Err(Error::InputShape(
                "image must be strictly positive before building a workspace".into(),
            ));
        }
        if !default.all_positive() {
            return Err(Error::InputShape(
                "default image must be strictly positive".into(),
            ));
        }

        let image_geom = ImageGeometry {
            nw: image.nw,
            ng: image.ng,
            n: image.n,
            vpix: image.vpix,
            lambda0: image.lambda0.as_slice().to_vec(),
            gamma: image.gamma.as_slice().to_vec(),
        };
        let data_geom = DataGeometry {
            ns: data.nspec(),
            np: data.npix(),
            vpixd: data.vpixd,
            lambda_d: data.lambda_d,
            time: data.time.as_slice().to_vec(),
            expose: data.expose.as_slice().to_vec(),
        };

        Ok(Self {
            image_geom,
            data_geom,
            ephemeris,
            params,
            f: image.data.as_slice().to_vec(),
            m: default.data.as_slice().to_vec(),
            d: data.data.as_slice().to_vec(),
            w: weights.as_slice().to_vec(),
        })
    }

    /// The current image as an [`ImageCube`].
    pub fn image(&self) -> Result<ImageCube> {
        Ok(ImageCube {
            nw: self.image_geom.nw,
            ng: self.image_geom.ng,
            n: self.image_geom.n,
            vpix: self.image_geom.vpix,
            lambda0: Array1::from_vec(self.image_geom.lambda0.clone()),
            gamma: Array1::from_vec(self.image_geom.gamma.clone()),
            data: Array3::from_vec(
                self.image_geom.nw * self.image_geom.ng,
                self.image_geom.n,
                self.image_geom.n,
                self.f.clone(),
            )?,
        })
    }

    /// Replace the default image (used when `default_image` runs again
    /// between iterations).
    pub fn set_default(&mut self, default: &ImageCube) -> Result<()> {
        if default.nw != self.image_geom.nw
            || default.ng != self.image_geom.ng
            || default.n != self.image_geom.n
        {
            return Err(Error::InputShape(
                "replacement default image shape does not match workspace".into(),
            ));
        }
        if !default.all_positive() {
            return Err(Error::InputShape(
                "default image must be strictly positive".into(),
            ));
        }
        self.m = default.data.as_slice().to_vec();
        Ok(())
    }
}

fn metric_inner(a: &[f32], b: &[f32], f: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .zip(f.iter())
        .map(|((&ai, &bi), &fi)| (ai as f64) * (bi as f64) / (fi as f64))
        .sum()
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(&x, &y)| x as f64 * y as f64).sum()
}

fn weighted_dot(w: &[f32], a: &[f32], b: &[f32]) -> f64 {
    w.iter()
        .zip(a.iter())
        .zip(b.iter())
        .map(|((&wi, &ai), &bi)| wi as f64 * ai as f64 * bi as f64)
        .sum()
}

/// Gram-Schmidt-orthogonalise `v` against `basis` under `⟨u, v⟩ = Σ u·v/f`.
fn project_out(mut v: Vec<f32>, basis: &[(Vec<f32>, f64)], f: &[f32]) -> Vec<f32> {
    for (u, norm2) in basis {
        if *norm2 > 1e-12 {
            let coeff = metric_inner(&v, u, f) / norm2;
            for (vi, &ui) in v.iter_mut().zip(u.iter()) {
                *vi -= (coeff * ui as f64) as f32;
            }
        }
    }
    v
}

fn cosine_test(f: &[f32], grad_s: &[f32], grad_c: &[f32]) -> f64 {
    let num: f64 = (0..f.len())
        .map(|i| f[i] as f64 * grad_s[i] as f64 * grad_c[i] as f64)
        .sum();
    let norm_s: f64 = (0..f.len())
        .map(|i| f[i] as f64 * (grad_s[i] as f64).powi(2))
        .sum::<f64>()
        .sqrt();
    let norm_c: f64 = (0..f.len())
        .map(|i| f[i] as f64 * (grad_c[i] as f64).powi(2))
        .sum::<f64>()
        .sqrt();
    if norm_s < 1e-30 || norm_c < 1e-30 {
        0.0
    } else {
        num / (norm_s * norm_c)
    }
}

/// Diagonal pivot at or below this magnitude is treated as a zero-norm
/// (rank-deficient) direction rather than a positive-definiteness failure —
/// the same threshold `project_out` uses to skip a degenerate basis vector.
const PIVOT_EPS: f64 = 1e-12;

/// Solve the symmetric positive-semidefinite `3x3` system `m x = b` via
/// Cholesky, forcing any zero-norm direction's coefficient to `0` and
/// dropping it from the system instead of treating it as non-PD.
fn solve3(m: [[f64; 3]; 3], b: [f64; 3]) -> Result<[f64; 3]> {
    let mut active = [true; 3];
    let mut l = [[0f64; 3]; 3];
    for i in 0..3 {
        for j in 0..i {
            if !active[j] {
                l[i][j] = 0.0;
                continue;
            }
            let mut sum = m[i][j];
            for k in 0..j {
                if active[k] {
                    sum -= l[i][k] * l[j][k];
                }
            }
            l[i][j] = sum / l[j][j];
        }
        let mut sum = m[i][i];
        for k in 0..i {
            if active[k] {
                sum -= l[i][k] * l[i][k];
            }
        }
        if sum.abs() <= PIVOT_EPS {
            active[i] = false;
            l[i][i] = 0.0;
        } else if sum < 0.0 {
            return Err(Error::NumericFailure(format!(
                "3x3 MEM subproblem is not positive-definite (pivot {sum} at row {i})"
            )));
        } else {
            l[i][i] = sum.sqrt();
        }
    }
    let mut y = [0f64; 3];
    for i in 0..3 {
        if !active[i] {
            continue;
        }
        let mut sum = b[i];
        for k in 0..i {
            if active[k] {
                sum -= l[i][k] * y[k];
            }
        }
        y[i] = sum / l[i][i];
    }
    let mut x = [0f64; 3];
    for i in (0..3).rev() {
        if !active[i] {
            continue;
        }
        let mut sum = y[i];
        for k in (i + 1)..3 {
            if active[k] {
                sum -= l[k][i] * x[k];
            }
        }
        x[i] = sum / l[i][i];
    }
    Ok(x)
}

/// One MEM iteration: gradients, three search directions, a constrained
/// quadratic subproblem, and a positivity-respecting step.
pub fn step(ws: &mut Workspace, caim: f32, rmax: f32, acc: f32) -> Result<StepReport> {
    for (i, &fi) in ws.f.iter().enumerate() {
        if fi <= 0.0 || !fi.is_finite() {
            return Err(Error::DomainViolation { index: i, value: fi });
        }
    }

    let opf = op(&ws.image_geom, &ws.data_geom, &ws.ephemeris, &ws.params, &ws.f)?;
    let r: Vec<f32> = opf
        .as_slice()
        .iter()
        .zip(ws.d.iter())
        .map(|(&o, &d)| o - d)
        .collect();
    let w_eff: Vec<f32> = ws.w.iter().map(|&x| x.max(0.0)).collect();
    let chisq: f64 = w_eff
        .iter()
        .zip(r.iter())
        .map(|(&w, &ri)| w as f64 * (ri as f64).powi(2))
        .sum();

    let entropy: f64 = ws
        .f
        .iter()
        .zip(ws.m.iter())
        .map(|(&fi, &mi)| fi as f64 - mi as f64 - fi as f64 * ((fi / mi) as f64).ln())
        .sum();
    debug!("mem::step: entropy={entropy:.6} chisq={chisq:.6}");

    let grad_s: Vec<f32> = ws
        .f
        .iter()
        .zip(ws.m.iter())
        .map(|(&fi, &mi)| -(fi / mi).ln())
        .collect();

    let wr: Array2<f32> = Array2::from_vec(ws.data_geom.ns, ws.data_geom.np, {
        w_eff.iter().zip(r.iter()).map(|(&w, &ri)| w * ri).collect()
    })?;
    let tr_wr = tr(&ws.image_geom, &ws.data_geom, &ws.ephemeris, &ws.params, wr.as_slice())?;
    let grad_c: Vec<f32> = tr_wr.as_slice().iter().map(|&v| 2.0 * v).collect();

    let test = cosine_test(&ws.f, &grad_s, &grad_c);
    trace!("mem::step: test={test:.6}");

    let e1: Vec<f32> = ws.f.iter().zip(grad_s.iter()).map(|(&fi, &g)| fi * g).collect();
    let e2: Vec<f32> = ws.f.iter().zip(grad_c.iter()).map(|(&fi, &g)| fi * g).collect();

    let mut basis: Vec<(Vec<f32>, f64)> = Vec::with_capacity(3);
    let mut directions: Vec<Vec<f32>> = Vec::with_capacity(3);
    for raw in [e1, e2, ws.f.clone()] {
        let ortho = project_out(raw, &basis, &ws.f);
        let norm2 = metric_inner(&ortho, &ortho, &ws.f);
        basis.push((ortho.clone(), norm2));
        directions.push(ortho);
    }
    let norms = [basis[0].1, basis[1].1, basis[2].1];

    let v: Vec<Vec<f32>> = directions
        .iter()
        .map(|u| {
            op(&ws.image_geom, &ws.data_geom, &ws.ephemeris, &ws.params, u)
                .map(|a| a.as_slice().to_vec())
        })
        .collect::<Result<_>>()?;

    let g_s = [
        dot(&grad_s, &directions[0]),
        dot(&grad_s, &directions[1]),
        dot(&grad_s, &directions[2]),
    ];
    let mut l_c = [0f64; 3];
    let mut h_c = [[0f64; 3]; 3];
    for k in 0..3 {
        l_c[k] = 2.0 * weighted_dot(&w_eff, &r, &v[k]);
        for kp in 0..3 {
            h_c[k][kp] = weighted_dot(&w_eff, &v[k], &v[kp]);
        }
    }

    let sum_f: f64 = ws.f.iter().map(|&x| x as f64).sum();
    let trust_max = (rmax as f64).powi(2) * sum_f;

    let solve_for_lambda = |lambda: f64| -> Result<[f64; 3]> {
        let mut m = [[0f64; 3]; 3];
        for i in 0..3 {
            m[i][i] += norms[i];
        }
        for i in 0..3 {
            for j in 0..3 {
                m[i][j] += 2.0 * lambda * h_c[i][j];
            }
        }
        let b = [
            g_s[0] - lambda * l_c[0],
            g_s[1] - lambda * l_c[1],
            g_s[2] - lambda * l_c[2],
        ];
        solve3(m, b)
    };
    let trust_of = |a: &[f64; 3]| -> f64 { (0..3).map(|i| a[i] * a[i] * norms[i]).sum() };
    // Quadratic model of chi-squared along a candidate step, from the same
    // expansion that built `l_c`/`h_c`: C(f + a.v) = C(f) + a.l_c + a^T H a.
    let predicted_chisq = |a: &[f64; 3]| -> f64 {
        let mut c = chisq;
        for k in 0..3 {
            c += a[k] * l_c[k];
            for kp in 0..3 {
                c += a[k] * a[kp] * h_c[k][kp];
            }
        }
        c
    };

    let caim64 = caim as f64;
    // lambda=0 is pure entropy climb and generally pushes C away from caim;
    // only take it unconditionally when C is already at or below the target,
    // since then there is no need to pull C down further. Otherwise bisect
    // lambda upward (outward) until the predicted C comes back down to caim
    // as well as the trust region being respected.
    let needs_c_reduction = chisq > caim64;

    let a0 = solve_for_lambda(0.0)?;
    let violates = |a: &[f64; 3]| -> bool {
        trust_of(a) > trust_max || (needs_c_reduction && predicted_chisq(a) > caim64)
    };
    let candidate = if !violates(&a0) {
        a0
    } else {
        let mut lo = 0.0f64;
        let mut hi = 1.0f64;
        while violates(&solve_for_lambda(hi)?) && hi < 1e12 {
            hi *= 4.0;
        }
        for _ in 0..60 {
            let mid = 0.5 * (lo + hi);
            if violates(&solve_for_lambda(mid)?) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        solve_for_lambda(hi)?
    };
    trace!("mem::step: candidate={candidate:?} trust_max={trust_max:.6} caim={caim}");

    let mut acc_used = acc;
    loop {
        let mut new_f = ws.f.clone();
        for k in 0..3 {
            let coeff = (candidate[k] * acc_used as f64) as f32;
            if coeff == 0.0 {
                continue;
            }
            for (fi, &ui) in new_f.iter_mut().zip(directions[k].iter()) {
                *fi += coeff * ui;
            }
        }
        if new_f.iter().all(|&x| x > 0.0 && x.is_finite()) {
            ws.f = new_f;
            break;
        }
        acc_used *= 0.5;
        if acc_used < 1e-6 {
            return Err(Error::NumericFailure(
                "step would drive a voxel non-positive even at minimal acc".into(),
            ));
        }
    }
    debug!("mem::step: acc_used={acc_used:.6}");

    Ok(StepReport {
        entropy: entropy as f32,
        chisq: chisq as f32,
        test: test as f32,
        acc_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_workspace() -> Workspace {
        let image_geom = ImageGeometry {
            nw: 1,
            ng: 1,
            n: 6,
            vpix: 100.0,
            lambda0: vec![6562.8],
            gamma: vec![0.0],
        };
        let data_geom = DataGeometry {
            ns: 4,
            np: 10,
            vpixd: 80.0,
            lambda_d: 6562.8,
            time: vec![0.0, 0.25, 0.5, 0.75],
            expose: vec![0.05; 4],
        };
        let ephemeris = Ephemeris {
            t0: 0.0,
            period: 1.0,
        };
        let params = ProjectionParams {
            fwhm: 150.0,
            ndiv: 1,
            ntdiv: 1,
        };
        let n_img = image_geom.nw * image_geom.ng * image_geom.n * image_geom.n;
        let f = vec![1.0f32; n_img];
        let data_vec = op(&image_geom, &data_geom, &ephemeris, &params, &f).unwrap();
        Workspace {
            image_geom,
            data_geom,
            ephemeris,
            params,
            m: f.clone(),
            f,
            d: data_vec.as_slice().to_vec(),
            w: vec![1.0; data_geom_len(&data_vec)],
        }
    }

    fn data_geom_len(a: &Array2<f32>) -> usize {
        a.rows() * a.cols()
    }

    #[test]
    fn step_keeps_image_positive() {
        let mut ws = toy_workspace();
        let report = step(&mut ws, 1e-3, 0.1, 1.0).unwrap();
        assert!(ws.f.iter().all(|&v| v > 0.0 && v.is_finite()));
        assert!(report.entropy.is_finite());
        assert!(report.chisq >= 0.0);
    }

    #[test]
    fn step_on_exact_match_keeps_chisq_small() {
        // f already equals m and op(f) == d exactly, so chisq should start
        // at (numerically) zero and entropy at zero.
        let mut ws = toy_workspace();
        let report = step(&mut ws, 1e-3, 0.1, 1.0).unwrap();
        assert!(report.chisq < 1e-2);
    }

    #[test]
    fn solve3_recovers_diagonal_system() {
        let m = [[2.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 4.0]];
        let b = [2.0, 6.0, 12.0];
        let x = solve3(m, b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
        assert!((x[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn solve3_rejects_non_positive_definite() {
        let m = [[1.0, 2.0, 0.0], [2.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let b = [0.0, 0.0, 0.0];
        assert!(solve3(m, b).is_err());
    }

    #[test]
    fn solve3_drops_zero_norm_direction_instead_of_erroring() {
        // Row/column 0 is identically zero, as happens when a search
        // direction has zero norm under the entropy metric (e.g. f == m).
        let m = [[0.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 4.0]];
        let b = [0.0, 6.0, 12.0];
        let x = solve3(m, b).unwrap();
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 2.0).abs() < 1e-9);
        assert!((x[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn step_pulls_chisq_toward_caim_when_above_it() {
        // Perturb the image away from the default so chisq starts above a
        // tight caim; the step must not be free to wander arbitrarily far
        // past the target on the way down.
        let mut ws = toy_workspace();
        for (i, fi) in ws.f.iter_mut().enumerate() {
            *fi += 0.3 * if i % 2 == 0 { 1.0 } else { -0.5 };
        }
        let caim = 1e-3;
        let report = step(&mut ws, caim, 0.1, 1.0).unwrap();
        assert!(ws.f.iter().all(|&v| v > 0.0 && v.is_finite()));
        assert!(report.chisq.is_finite());
    }
}
