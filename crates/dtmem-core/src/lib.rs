//! # dtmem-core
//!
//! **Maximum-entropy Doppler tomography.**
//!
//! `dtmem-core` reconstructs a 2-D velocity-space emission map of a binary
//! star's accretion flow from a trailed spectrum — a time series of spectra
//! taken across an orbital cycle. Every orbital phase sees a different
//! Doppler-shifted slice through velocity space; a maximum-entropy inversion
//! finds the flattest image consistent with that data to within its noise.
//!
//! ## Quick start
//!
//! ```no_run
//! use dtmem_core::codec::{ImageCube, TrailedSpectrum};
//! use dtmem_core::driver::{self, DefaultMode, RunParams};
//!
//! # fn go() -> dtmem_core::error::Result<()> {
//! let image = driver::read_image_cube("start.map")?;
//! let data = driver::read_trailed_spectrum("star.trail")?;
//! let params = RunParams {
//!     niter: 50,
//!     caim: 1.0,
//!     rmax: 0.2,
//!     tlim: 1e-3,
//!     acc: 0.5,
//!     default_mode: DefaultMode::Uniform,
//!     fwhm: 150.0,
//!     ndiv: 2,
//!     ntdiv: 2,
//!     tzero: 0.0,
//!     period: 0.1,
//! };
//! let (result, report): (ImageCube, _) = driver::run(image, data, params)?;
//! println!("converged: {}", report.converged);
//! # Ok(()) }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! codec            (binary I/O for image cubes and trailed spectra)
//!   └─ default_image  (uniform/Gaussian default image m)
//!        └─ projector   (op/tr: image <-> data)
//!             └─ mem      (entropy/chi-squared maximiser)
//!                  └─ driver  (load -> iterate -> write)
//! fft   (radix-2 FFT; filtered_backprojection quick-look inversion)
//! ```
//!
//! `op` and `tr` are exact adjoints of each other (`⟨op(a), b⟩ = ⟨a, tr(b)⟩`)
//! — every downstream module depends on that identity holding.

pub mod array;
pub mod codec;
pub mod constants;
pub mod default_image;
pub mod driver;
pub mod error;
pub mod fft;
pub mod mem;
pub mod projector;

pub use array::{Array1, Array2, Array3};
pub use codec::{ImageCube, TrailedSpectrum};
pub use constants::EFAC;
pub use error::{Error, Result};
pub use mem::{StepReport, Workspace};
pub use projector::{op, tr, DataGeometry, Ephemeris, ImageGeometry, ProjectionParams};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
