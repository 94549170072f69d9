//! `dtmem` — driver CLI for maximum-entropy Doppler tomography inversion.

mod config;
mod report;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use dtmem_core::driver::{self, DefaultMode, RunParams};

#[derive(Parser)]
#[command(name = "dtmem")]
#[command(about = "Maximum-entropy Doppler tomography inversion")]
#[command(version = dtmem_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MEM inversion on an image cube and a trailed spectrum.
    Run {
        /// Starting image cube (`-` for stdin).
        map: String,

        /// Trailed spectrum to invert against (`-` for stdin).
        trail: String,

        /// Maximum number of MEM iterations.
        #[arg(long, default_value = "50")]
        niter: u32,

        /// Target chi-squared.
        #[arg(long, default_value = "1.0")]
        caim: f32,

        /// Trust-region radius, as a fraction of total flux.
        #[arg(long, default_value = "0.2")]
        rmax: f32,

        /// Default-image mode.
        #[arg(long, default_value = "uniform", value_parser = ["uniform", "gaussian"])]
        default: String,

        /// Gaussian default FWHM in the image plane, pixels (gaussian mode only).
        #[arg(long)]
        blurr: Option<f32>,

        /// Gaussian default FWHM along gamma, slices (gaussian mode only).
        #[arg(long)]
        gblurr: Option<f32>,

        /// Convergence threshold on the entropy/chi-squared gradient angle.
        #[arg(long, default_value = "0.001")]
        tlim: f32,

        /// Local line-profile FWHM, km/s.
        #[arg(long)]
        fwhm: f32,

        /// Sub-pixel divisions per image-pixel axis.
        #[arg(long, default_value = "1")]
        ndiv: usize,

        /// Sub-phase divisions per exposure.
        #[arg(long, default_value = "1")]
        ntdiv: usize,

        /// Ephemeris zero phase time.
        #[arg(long, default_value = "0.0")]
        tzero: f64,

        /// Orbital period, same time unit as the data's `time` array.
        #[arg(long)]
        period: f64,

        /// Output image cube path (`-` for stdout).
        output: String,

        /// Write a JSON run report alongside the output image.
        #[arg(long)]
        report: Option<String>,
    },
}

fn validate_run_args(
    niter: u32,
    caim: f32,
    rmax: f32,
    tlim: f32,
    fwhm: f32,
    ndiv: usize,
    ntdiv: usize,
    period: f64,
    default: &str,
    blurr: Option<f32>,
    gblurr: Option<f32>,
) -> dtmem_core::error::Result<DefaultMode> {
    use dtmem_core::error::Error;

    if !(1..(1u32 << 31)).contains(&niter) {
        return Err(Error::InputShape(format!("niter must be in [1, 2^31), found {niter}")));
    }
    if !(caim > 1e-5) {
        return Err(Error::InputShape(format!("caim must be > 1e-5, found {caim}")));
    }
    if !(rmax > 1e-3 && rmax <= 1.0) {
        return Err(Error::InputShape(format!("rmax must be in (1e-3, 1], found {rmax}")));
    }
    if !(tlim > 1e-4 && tlim <= 1.0) {
        return Err(Error::InputShape(format!("tlim must be in (1e-4, 1], found {tlim}")));
    }
    if !(fwhm > 0.0) {
        return Err(Error::InputShape(format!("fwhm must be > 0, found {fwhm}")));
    }
    if !(1..=200).contains(&ndiv) {
        return Err(Error::InputShape(format!("ndiv must be in [1, 200], found {ndiv}")));
    }
    if !(1..=200).contains(&ntdiv) {
        return Err(Error::InputShape(format!("ntdiv must be in [1, 200], found {ntdiv}")));
    }
    if !(period > 1e-6) {
        return Err(Error::InputShape(format!("period must be > 1e-6, found {period}")));
    }

    match default {
        "uniform" => Ok(DefaultMode::Uniform),
        "gaussian" => {
            let blurr = blurr.ok_or_else(|| {
                Error::InputShape("--blurr is required when --default=gaussian".into())
            })?;
            let gblurr = gblurr.ok_or_else(|| {
                Error::InputShape("--gblurr is required when --default=gaussian".into())
            })?;
            if !(blurr > 0.0 && gblurr > 0.0) {
                return Err(Error::InputShape(format!(
                    "blurr/gblurr must be > 0, found blurr={blurr} gblurr={gblurr}"
                )));
            }
            Ok(DefaultMode::Gaussian { blurr, gblurr })
        }
        other => Err(Error::InputShape(format!("unknown default mode {other}"))),
    }
}

fn run_command(
    map: String,
    trail: String,
    niter: u32,
    caim: f32,
    rmax: f32,
    default: String,
    blurr: Option<f32>,
    gblurr: Option<f32>,
    tlim: f32,
    fwhm: f32,
    ndiv: usize,
    ntdiv: usize,
    tzero: f64,
    period: f64,
    output: String,
    report_path: Option<String>,
) -> dtmem_core::error::Result<()> {
    let default_mode = validate_run_args(
        niter, caim, rmax, tlim, fwhm, ndiv, ntdiv, period, &default, blurr, gblurr,
    )?;

    let params = RunParams {
        niter,
        caim,
        rmax,
        tlim,
        acc: 1.0,
        default_mode,
        fwhm,
        ndiv,
        ntdiv,
        tzero,
        period,
    };

    config::persist_last_run(&config::LastRun {
        map: map.clone(),
        trail: trail.clone(),
        niter,
        caim,
        rmax,
        default: default.clone(),
        tlim,
        fwhm,
        ndiv,
        ntdiv,
        tzero,
        period,
        output: output.clone(),
    });

    let image = driver::read_image_cube(&map)?;
    let data = driver::read_trailed_spectrum(&trail)?;
    let (result, run_report) = driver::run(image, data, params)?;
    driver::write_image_cube(&output, &result)?;

    if let Some(path) = report_path {
        report::write_run_report(&path, &run_report)?;
    }

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            map,
            trail,
            niter,
            caim,
            rmax,
            default,
            blurr,
            gblurr,
            tlim,
            fwhm,
            ndiv,
            ntdiv,
            tzero,
            period,
            output,
            report,
        } => run_command(
            map, trail, niter, caim, rmax, default, blurr, gblurr, tlim, fwhm, ndiv, ntdiv, tzero,
            period, output, report,
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("dtmem: {err}");
            ExitCode::FAILURE
        }
    }
}
