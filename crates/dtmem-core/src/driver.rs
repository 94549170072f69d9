//! Linear driver: load, validate, allocate a workspace, iterate the default
//! image and MEM step, write the result.
//!
//! The only branch is the default-image mode; everything else is a
//! straight-line loop, matching the legacy `dtmem.cc` main loop's shape
//! (`ddef` then `memit` each iteration, terminate on `test < tlim && c <=
//! caim` or the iteration budget).

use log::info;

use crate::array::Array2;
use crate::codec::{ImageCube, TrailedSpectrum};
use crate::default_image::{default_gaussian, default_uniform};
use crate::error::{Error, Result};
use crate::mem::{step, StepReport, Workspace};
use crate::projector::{Ephemeris, ProjectionParams};

/// How the default image `m` is rebuilt each iteration.
#[derive(Debug, Clone, Copy)]
pub enum DefaultMode {
    Uniform,
    Gaussian { blurr: f32, gblurr: f32 },
}

/// Every tunable of a run, the Rust-native equivalent of the legacy CLI's
/// prompted parameters.
#[derive(Debug, Clone, Copy)]
pub struct RunParams {
    pub niter: u32,
    pub caim: f32,
    pub rmax: f32,
    pub tlim: f32,
    pub acc: f32,
    pub default_mode: DefaultMode,
    pub fwhm: f32,
    pub ndiv: usize,
    pub ntdiv: usize,
    pub tzero: f64,
    pub period: f64,
}

/// One iteration's outcome, logged for the run report.
#[derive(Debug, Clone, Copy)]
pub struct IterationLog {
    pub iteration: u32,
    pub entropy: f32,
    pub chisq: f32,
    pub test: f32,
    pub acc_used: f32,
}

/// Full run outcome: the per-iteration trace and whether the termination
/// condition (`test < tlim && chisq <= caim`) was reached before `niter`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub iterations: Vec<IterationLog>,
    pub converged: bool,
}

/// `w = 2/(σ²·Ndat)`, `Ndat` counting every data pixel including masked
/// ones (`err <= 0`), which get weight `0`.
fn weights_from_err(err: &Array2<f32>) -> Array2<f32> {
    let ndat = err.len() as f32;
    let mut w = Array2::<f32>::zeros(err.rows(), err.cols());
    for (wi, &ei) in w.as_mut_slice().iter_mut().zip(err.as_slice().iter()) {
        *wi = if ei > 0.0 { 2.0 / (ei * ei * ndat) } else { 0.0 };
    }
    w
}

fn build_default(image: &ImageCube, mode: DefaultMode) -> Result<ImageCube> {
    match mode {
        DefaultMode::Uniform => default_uniform(image),
        DefaultMode::Gaussian { blurr, gblurr } => default_gaussian(image, blurr, gblurr),
    }
}

/// Run the full MEM inversion: build the initial default, then iterate
/// `default_image` + `mem::step` up to `params.niter` times.
pub fn run(image: ImageCube, data: TrailedSpectrum, params: RunParams) -> Result<(ImageCube, RunReport)> {
    if !image.all_positive() {
        return Err(Error::InputShape(
            "initial image must be strictly positive".into(),
        ));
    }
    if !data.data.shape_matches(&data.err) {
        return Err(Error::ShapeMismatch {
            what: "trailed spectrum".to_string(),
            detail: "data and err must share a shape".to_string(),
        });
    }

    let ephemeris = Ephemeris {
        t0: params.tzero,
        period: params.period,
    };
    let projection = ProjectionParams {
        fwhm: params.fwhm,
        ndiv: params.ndiv,
        ntdiv: params.ntdiv,
    };
    let weights = weights_from_err(&data.err);

    let default = build_default(&image, params.default_mode)?;
    let mut ws = Workspace::new(&image, &default, &data, &weights, ephemeris, projection)?;

    let mut iterations = Vec::with_capacity(params.niter as usize);
    let mut converged = false;
    for iteration in 1..=params.niter {
        let current = ws.image()?;
        let default = build_default(&current, params.default_mode)?;
        ws.set_default(&default)?;

        let report: StepReport = step(&mut ws, params.caim, params.rmax, params.acc)?;
        info!(
            "iteration {iteration}/{}: entropy={:.4} chisq={:.4} test={:.4} acc={:.4}",
            params.niter, report.entropy, report.chisq, report.test, report.acc_used
        );
        iterations.push(IterationLog {
            iteration,
            entropy: report.entropy,
            chisq: report.chisq,
            test: report.test,
            acc_used: report.acc_used,
        });

        if report.test < params.tlim && report.chisq <= params.caim {
            converged = true;
            break;
        }
    }

    Ok((ws.image()?, RunReport { iterations, converged }))
}

/// Read an [`ImageCube`] from a file, or from stdin if `path == "-"`
/// (mirrors `Trail`'s own stdin/stdout convention in the legacy codebase).
pub fn read_image_cube(path: &str) -> Result<ImageCube> {
    if path == "-" {
        let stdin = std::io::stdin();
        let mut lock = stdin.lock();
        ImageCube::read(&mut lock)
    } else {
        let mut file = std::fs::File::open(path)?;
        ImageCube::read(&mut file)
    }
}

/// Write an [`ImageCube`] to a file, or to stdout if `path == "-"`.
pub fn write_image_cube(path: &str, image: &ImageCube) -> Result<()> {
    if path == "-" {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        image.write(&mut lock)
    } else {
        let mut file = std::fs::File::create(path)?;
        image.write(&mut file)
    }
}

/// Read a [`TrailedSpectrum`] from a file, or from stdin if `path == "-"`.
pub fn read_trailed_spectrum(path: &str) -> Result<TrailedSpectrum> {
    if path == "-" {
        let stdin = std::io::stdin();
        let mut lock = stdin.lock();
        TrailedSpectrum::read(&mut lock)
    } else {
        let mut file = std::fs::File::open(path)?;
        TrailedSpectrum::read(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array1, Array2};

    fn tiny_image() -> ImageCube {
        let mut cube = ImageCube::zeros(1, 1, 6, 100.0).unwrap();
        cube.lambda0.set(0, 6562.8).unwrap();
        cube.gamma.set(0, 0.0).unwrap();
        cube.data.fill(1.0);
        cube
    }

    fn tiny_trail(vpixd: f32, np: usize, ns: usize) -> TrailedSpectrum {
        TrailedSpectrum {
            vpixd,
            lambda_d: 6562.8,
            time: Array1::from_vec((0..ns).map(|i| i as f64 / ns as f64).collect()),
            expose: Array1::from_vec(vec![0.02; ns]),
            data: Array2::from_vec(ns, np, vec![1.0; ns * np]).unwrap(),
            err: Array2::from_vec(ns, np, vec![1.0; ns * np]).unwrap(),
        }
    }

    #[test]
    fn weights_from_err_zeros_out_masked_pixels() {
        let mut err = Array2::<f32>::zeros(2, 2);
        err.set(0, 0, 1.0).unwrap();
        err.set(0, 1, -1.0).unwrap();
        err.set(1, 0, 0.0).unwrap();
        err.set(1, 1, 2.0).unwrap();
        let w = weights_from_err(&err);
        assert_eq!(w.get(0, 1).unwrap(), 0.0);
        assert_eq!(w.get(1, 0).unwrap(), 0.0);
        assert!(w.get(0, 0).unwrap() > 0.0);
        assert!(w.get(1, 1).unwrap() > 0.0);
    }

    #[test]
    fn run_rejects_nonpositive_initial_image() {
        let mut image = tiny_image();
        image.data.as_mut_slice()[0] = -1.0;
        let trail = tiny_trail(80.0, 8, 3);
        let params = RunParams {
            niter: 2,
            caim: 1.0,
            rmax: 0.1,
            tlim: 1e-3,
            acc: 1.0,
            default_mode: DefaultMode::Uniform,
            fwhm: 150.0,
            ndiv: 1,
            ntdiv: 1,
            tzero: 0.0,
            period: 1.0,
        };
        assert!(run(image, trail, params).is_err());
    }

    #[test]
    fn run_completes_and_stays_positive() {
        let image = tiny_image();
        let trail = tiny_trail(80.0, 8, 3);
        let params = RunParams {
            niter: 3,
            caim: 1.0,
            rmax: 0.2,
            tlim: 1e-6,
            acc: 0.5,
            default_mode: DefaultMode::Uniform,
            fwhm: 150.0,
            ndiv: 1,
            ntdiv: 1,
            tzero: 0.0,
            period: 1.0,
        };
        let (out, report) = run(image, trail, params).unwrap();
        assert!(out.all_positive());
        assert_eq!(report.iterations.len().min(3), report.iterations.len());
        assert!(!report.iterations.is_empty());
    }
}
