//! Forward projector `op` (image → data) and its exact adjoint `tr`
//! (data → image).
//!
//! Both walk the same five nested loops — spectrum `s`, sub-exposure `it`,
//! image pixel `(w, g, y, x)`, pixel sub-sample `(idy, idx)`, and data pixel
//! `p` within the line profile's `±3σ` window — and use exactly the same
//! weights. `op` reads the image and writes the data; `tr` reads the data
//! and writes the image. Keeping the weight computation
//! ([`pixel_contributions`]) in one place is what makes the adjoint
//! identity in `dtmem-tests` hold by construction rather than by luck.

use rayon::prelude::*;

use crate::array::{Array2, Array3};
use crate::constants::EFAC;
use crate::error::{Error, Result};

/// Speed of light, km/s.
pub const C_KM_S: f64 = 299_792.458;

/// Geometry of the image cube that the projector needs (no pixel data).
#[derive(Debug, Clone)]
pub struct ImageGeometry {
    pub nw: usize,
    pub ng: usize,
    pub n: usize,
    pub vpix: f32,
    pub lambda0: Vec<f64>,
    pub gamma: Vec<f32>,
}

impl ImageGeometry {
    pub fn slice_count(&self) -> usize {
        self.nw * self.ng
    }

    fn vx(&self, x: f64) -> f64 {
        self.vpix as f64 * (x - (self.n as f64 - 1.0) / 2.0)
    }
}

/// Geometry of the trailed spectrum that the projector needs (no data/err).
#[derive(Debug, Clone)]
pub struct DataGeometry {
    pub ns: usize,
    pub np: usize,
    pub vpixd: f32,
    pub lambda_d: f64,
    pub time: Vec<f64>,
    pub expose: Vec<f32>,
}

/// Zero-phase time and period of the binary's orbit.
#[derive(Debug, Clone, Copy)]
pub struct Ephemeris {
    pub t0: f64,
    pub period: f64,
}

impl Ephemeris {
    pub fn phase(&self, t: f64) -> f64 {
        (t - self.t0) / self.period
    }
}

/// Numeric parameters of the forward model.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionParams {
    /// FWHM of the local line profile, km/s.
    pub fwhm: f32,
    /// Sub-sample factor per image pixel axis (`Nd`).
    pub ndiv: usize,
    /// Number of sub-phases per exposure (`Nt`).
    pub ntdiv: usize,
}

impl ProjectionParams {
    fn sigma_p(&self, vpixd: f32) -> f64 {
        self.fwhm as f64 / (vpixd as f64 * EFAC)
    }
}

fn subpixel_offsets(ndiv: usize) -> Vec<(f64, f64)> {
    let step = 1.0 / ndiv as f64;
    let mut offsets = Vec::with_capacity(ndiv * ndiv);
    for idy in 0..ndiv {
        let dy = -0.5 + (idy as f64 + 0.5) * step;
        for idx in 0..ndiv {
            let dx = -0.5 + (idx as f64 + 0.5) * step;
            offsets.push((dx, dy));
        }
    }
    offsets
}

fn sub_phases(phi_centre: f64, dphi: f64, ntdiv: usize) -> Vec<f64> {
    let mut phases = Vec::with_capacity(ntdiv);
    for it in 0..ntdiv {
        let frac = (it as f64 + 0.5) / ntdiv as f64 - 0.5;
        phases.push(phi_centre + frac * dphi);
    }
    phases
}

/// `(p, weight)` pairs that a single (sub-sampled, sub-phased) image pixel
/// contributes to spectrum `s`. Weight already folds in the `1/Nt` and
/// `1/Nd²` averaging factors and the normalised Gaussian line profile.
fn pixel_contributions(
    image_geom: &ImageGeometry,
    data_geom: &DataGeometry,
    ephem: &Ephemeris,
    params: &ProjectionParams,
    w: usize,
    g: usize,
    y: usize,
    x: usize,
    s: usize,
) -> Vec<(usize, f32)> {
    let phi_centre = ephem.phase(data_geom.time[s]);
    let dphi = data_geom.expose[s] as f64 / ephem.period;
    let sigma_p = params.sigma_p(data_geom.vpixd);
    let lambda0 = image_geom.lambda0[w];
    let gamma = image_geom.gamma[g] as f64;
    let offsets = subpixel_offsets(params.ndiv);
    let phases = sub_phases(phi_centre, dphi, params.ntdiv);

    let nt_weight = 1.0 / params.ntdiv as f64;
    let nd_weight = 1.0 / (params.ndiv * params.ndiv) as f64;

    let mut out = Vec::new();
    for &phi in &phases {
        let (sin_p, cos_p) = (2.0 * std::f64::consts::PI * phi).sin_cos();
        for &(dx, dy) in &offsets {
            let vx = image_geom.vx(x as f64 + dx);
            let vy = image_geom.vx(y as f64 + dy);
            let vlos = gamma - vx * sin_p - vy * cos_p;
            let p_star = C_KM_S / data_geom.vpixd as f64
                * (lambda0 * (1.0 + vlos / C_KM_S) / data_geom.lambda_d).ln();

            let lo = (p_star - 3.0 * sigma_p).ceil() as i64;
            let hi = (p_star + 3.0 * sigma_p).floor() as i64;
            let lo = lo.max(0);
            let hi = hi.min(data_geom.np as i64 - 1);
            if lo > hi {
                continue;
            }
            let norm = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma_p);
            for p in lo..=hi {
                let z = (p as f64 - p_star) / sigma_p;
                let gauss = norm * (-0.5 * z * z).exp();
                let weight = nt_weight * nd_weight * gauss;
                out.push((p as usize, weight as f32));
            }
        }
    }
    out
}

fn check_geometry(image_geom: &ImageGeometry, data_geom: &DataGeometry) -> Result<()> {
    if image_geom.lambda0.len() != image_geom.nw {
        return Err(Error::InputShape(format!(
            "lambda0 has {} entries, expected Nw={}",
            image_geom.lambda0.len(),
            image_geom.nw
        )));
    }
    if image_geom.gamma.len() != image_geom.ng {
        return Err(Error::InputShape(format!(
            "gamma has {} entries, expected Ng={}",
            image_geom.gamma.len(),
            image_geom.ng
        )));
    }
    if data_geom.time.len() != data_geom.ns || data_geom.expose.len() != data_geom.ns {
        return Err(Error::InputShape(format!(
            "time/expose must have Ns={} entries, found time={} expose={}",
            data_geom.ns,
            data_geom.time.len(),
            data_geom.expose.len()
        )));
    }
    Ok(())
}

/// Forward projector: image → data. Deterministic, internally parallel over
/// spectra `s`.
pub fn op(
    image_geom: &ImageGeometry,
    data_geom: &DataGeometry,
    ephem: &Ephemeris,
    params: &ProjectionParams,
    image: &[f32],
) -> Result<Array2<f32>> {
    check_geometry(image_geom, data_geom)?;
    let expected = image_geom.slice_count() * image_geom.n * image_geom.n;
    if image.len() != expected {
        return Err(Error::InputShape(format!(
            "image length {} does not match geometry ({} elements)",
            image.len(),
            expected
        )));
    }

    let n = image_geom.n;
    let rows: Vec<Vec<f32>> = (0..data_geom.ns)
        .into_par_iter()
        .map(|s| {
            let mut row = vec![0.0f32; data_geom.np];
            for w in 0..image_geom.nw {
                for g in 0..image_geom.ng {
                    let slice = w * image_geom.ng + g;
                    let base = slice * n * n;
                    for y in 0..n {
                        for x in 0..n {
                            let value = image[base + y * n + x];
                            if value == 0.0 {
                                continue;
                            }
                            for (p, weight) in
                                pixel_contributions(image_geom, data_geom, ephem, params, w, g, y, x, s)
                            {
                                row[p] += value * weight;
                            }
                        }
                    }
                }
            }
            row
        })
        .collect();

    let mut data = Array2::zeros(data_geom.ns, data_geom.np);
    for (s, row) in rows.into_iter().enumerate() {
        data.row_mut(s)?.copy_from_slice(&row);
    }
    Ok(data)
}

/// Adjoint projector: data → image. Deterministic, internally parallel over
/// image slices `(w, g)`.
pub fn tr(
    image_geom: &ImageGeometry,
    data_geom: &DataGeometry,
    ephem: &Ephemeris,
    params: &ProjectionParams,
    data: &[f32],
) -> Result<Array3<f32>> {
    check_geometry(image_geom, data_geom)?;
    let expected = data_geom.ns * data_geom.np;
    if data.len() != expected {
        return Err(Error::InputShape(format!(
            "data length {} does not match geometry ({} elements)",
            data.len(),
            expected
        )));
    }

    let n = image_geom.n;
    let slices: Vec<Vec<f32>> = (0..image_geom.slice_count())
        .into_par_iter()
        .map(|slice| {
            let w = slice / image_geom.ng;
            let g = slice % image_geom.ng;
            let mut out = vec![0.0f32; n * n];
            for y in 0..n {
                for x in 0..n {
                    let mut acc = 0.0f32;
                    for s in 0..data_geom.ns {
                        let row = &data[s * data_geom.np..(s + 1) * data_geom.np];
                        for (p, weight) in
                            pixel_contributions(image_geom, data_geom, ephem, params, w, g, y, x, s)
                        {
                            acc += row[p] * weight;
                        }
                    }
                    out[y * n + x] = acc;
                }
            }
            out
        })
        .collect();

    let mut image = Array3::zeros(image_geom.slice_count(), n, n);
    for (slice, vals) in slices.into_iter().enumerate() {
        image.slice_mut(slice)?.copy_from_slice(&vals);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geoms() -> (ImageGeometry, DataGeometry, Ephemeris, ProjectionParams) {
        let image_geom = ImageGeometry {
            nw: 1,
            ng: 1,
            n: 8,
            vpix: 100.0,
            lambda0: vec![6562.8],
            gamma: vec![0.0],
        };
        let data_geom = DataGeometry {
            ns: 5,
            np: 16,
            vpixd: 80.0,
            lambda_d: 6562.8,
            time: vec![0.0, 0.2, 0.4, 0.6, 0.8],
            expose: vec![0.05; 5],
        };
        let ephem = Ephemeris {
            t0: 0.0,
            period: 1.0,
        };
        let params = ProjectionParams {
            fwhm: 150.0,
            ndiv: 4,
            ntdiv: 4,
        };
        (image_geom, data_geom, ephem, params)
    }

    #[test]
    fn op_produces_expected_shape() {
        let (image_geom, data_geom, ephem, params) = geoms();
        let image = vec![1.0f32; image_geom.slice_count() * image_geom.n * image_geom.n];
        let data = op(&image_geom, &data_geom, &ephem, &params, &image).unwrap();
        assert_eq!(data.rows(), data_geom.ns);
        assert_eq!(data.cols(), data_geom.np);
    }

    #[test]
    fn tr_produces_expected_shape() {
        let (image_geom, data_geom, ephem, params) = geoms();
        let data = vec![1.0f32; data_geom.ns * data_geom.np];
        let image = tr(&image_geom, &data_geom, &ephem, &params, &data).unwrap();
        assert_eq!(image.depth(), image_geom.slice_count());
        assert_eq!(image.rows(), image_geom.n);
        assert_eq!(image.cols(), image_geom.n);
    }

    #[test]
    fn adjoint_identity_holds() {
        let (image_geom, data_geom, ephem, params) = geoms();
        let mut state = 0x2545F4914F6CDD1Du64;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 40) as f32 / (1u64 << 24) as f32
        };
        let n_img = image_geom.slice_count() * image_geom.n * image_geom.n;
        let n_dat = data_geom.ns * data_geom.np;
        let a: Vec<f32> = (0..n_img).map(|_| 0.1 + next().abs()).collect();
        let b: Vec<f32> = (0..n_dat).map(|_| next()).collect();

        let op_a = op(&image_geom, &data_geom, &ephem, &params, &a).unwrap();
        let tr_b = tr(&image_geom, &data_geom, &ephem, &params, &b).unwrap();

        let lhs: f64 = op_a
            .as_slice()
            .iter()
            .zip(b.iter())
            .map(|(&x, &y)| x as f64 * y as f64)
            .sum();
        let rhs: f64 = a
            .iter()
            .zip(tr_b.as_slice().iter())
            .map(|(&x, &y)| x as f64 * y as f64)
            .sum();

        let norm_a: f64 = a.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
        let tol = 1e-4 * norm_a * norm_b;
        assert!(
            (lhs - rhs).abs() <= tol.max(1e-6),
            "adjoint identity violated: lhs={lhs} rhs={rhs} tol={tol}"
        );
    }
}
