//! Binary codec for the two artifacts the engine trades in: an image cube
//! and a trailed spectrum.
//!
//! Both formats are a magic `i32`, a handful of scalars, then arrays in
//! row-major order — native little-endian, no alignment padding. Embedded
//! arrays are self-describing: a `{rank: i32, dim0: i32, …}` header precedes
//! the raw values, so a reader can catch a cross-array shape disagreement
//! (`data` vs `err`, or a declared length vs what a sibling array declares)
//! without guessing.
//!
//! This is a new, documented container, not a byte-for-bit reproduction of
//! the legacy `Dmap`/`Trail` binaries — only the two magic numbers are
//! carried over (the trail magic from `original_source/include/trm_trail.h`'s
//! `Trail::flag`, and the map magic chosen here since the legacy format
//! didn't version itself). Read/write round-trips exactly.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::array::{Array1, Array2, Array3};
use crate::error::{Error, Result};

/// Magic number for an image-cube file.
pub const MAP_MAGIC: i32 = 0x010D_4A50;

/// Magic number for a trailed-spectrum file, preserved from the legacy
/// `Trail::flag` constant.
pub const TRAIL_MAGIC: i32 = 1_235_641;

fn map_eof(e: std::io::Error, what: &str) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Truncated {
            what: what.to_string(),
            needed: 1,
        }
    } else {
        Error::Io(e)
    }
}

fn read_i32<R: Read>(r: &mut R, what: &str) -> Result<i32> {
    r.read_i32::<LittleEndian>().map_err(|e| map_eof(e, what))
}

fn read_f32<R: Read>(r: &mut R, what: &str) -> Result<f32> {
    r.read_f32::<LittleEndian>().map_err(|e| map_eof(e, what))
}

fn read_f64<R: Read>(r: &mut R, what: &str) -> Result<f64> {
    r.read_f64::<LittleEndian>().map_err(|e| map_eof(e, what))
}

fn read_f32_vec<R: Read>(r: &mut R, n: usize, what: &str) -> Result<Vec<f32>> {
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(read_f32(r, what)?);
    }
    Ok(v)
}

fn read_f64_vec<R: Read>(r: &mut R, n: usize, what: &str) -> Result<Vec<f64>> {
    let mut v = Vec::with_capacity(n);
    for _ in 0..n {
        v.push(read_f64(r, what)?);
    }
    Ok(v)
}

fn write_f32_slice<W: Write>(w: &mut W, v: &[f32]) -> Result<()> {
    for &x in v {
        w.write_f32::<LittleEndian>(x)?;
    }
    Ok(())
}

fn write_f64_slice<W: Write>(w: &mut W, v: &[f64]) -> Result<()> {
    for &x in v {
        w.write_f64::<LittleEndian>(x)?;
    }
    Ok(())
}

/// Array header: `{rank, dim0, dim1, ...}`.
fn write_header<W: Write>(w: &mut W, dims: &[usize]) -> Result<()> {
    w.write_i32::<LittleEndian>(dims.len() as i32)?;
    for &d in dims {
        w.write_i32::<LittleEndian>(d as i32)?;
    }
    Ok(())
}

fn read_header<R: Read>(r: &mut R, what: &str) -> Result<Vec<usize>> {
    let rank = read_i32(r, what)?;
    if rank < 0 {
        return Err(Error::ShapeMismatch {
            what: what.to_string(),
            detail: format!("negative rank {rank}"),
        });
    }
    let mut dims = Vec::with_capacity(rank as usize);
    for _ in 0..rank {
        let d = read_i32(r, what)?;
        if d < 0 {
            return Err(Error::ShapeMismatch {
                what: what.to_string(),
                detail: format!("negative dimension {d}"),
            });
        }
        dims.push(d as usize);
    }
    Ok(dims)
}

fn expect_dims(what: &str, dims: &[usize], expected: &[usize]) -> Result<()> {
    if dims != expected {
        return Err(Error::ShapeMismatch {
            what: what.to_string(),
            detail: format!("expected dims {expected:?}, found {dims:?}"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Image cube
// ---------------------------------------------------------------------------

/// A 4-index image cube `M[w][g][y][x]`, stored as an `(Nw·Ng) × N × N`
/// stack of square images.
#[derive(Debug, Clone)]
pub struct ImageCube {
    pub nw: usize,
    pub ng: usize,
    pub n: usize,
    pub vpix: f32,
    pub lambda0: Array1<f64>,
    pub gamma: Array1<f32>,
    pub data: Array3<f32>,
}

impl ImageCube {
    /// A zero-filled cube of the given shape. Callers must populate `data`
    /// with strictly positive values before handing it to the inversion.
    pub fn zeros(nw: usize, ng: usize, n: usize, vpix: f32) -> Result<Self> {
        if nw == 0 || ng == 0 || n == 0 {
            return Err(Error::InputShape(format!(
                "image cube dimensions must be >= 1, found Nw={nw} Ng={ng} N={n}"
            )));
        }
        Ok(Self {
            nw,
            ng,
            n,
            vpix,
            lambda0: Array1::zeros(nw),
            gamma: Array1::zeros(ng),
            data: Array3::zeros(nw * ng, n, n),
        })
    }

    /// Flattened `(w, g)` -> depth index into `data`.
    pub fn slice_index(&self, w: usize, g: usize) -> Result<usize> {
        if w >= self.nw || g >= self.ng {
            return Err(Error::InputShape(format!(
                "(w={w}, g={g}) out of bounds for Nw={} Ng={}",
                self.nw, self.ng
            )));
        }
        Ok(w * self.ng + g)
    }

    pub fn pixel(&self, w: usize, g: usize, y: usize, x: usize) -> Result<f32> {
        self.data.get(self.slice_index(w, g)?, y, x)
    }

    pub fn set_pixel(&mut self, w: usize, g: usize, y: usize, x: usize, value: f32) -> Result<()> {
        let d = self.slice_index(w, g)?;
        self.data.set(d, y, x, value)
    }

    /// Velocity-space x coordinate of pixel column `x`, the `(N−1)/2`
    /// centre-pixel convention.
    pub fn vx(&self, x: usize) -> f32 {
        self.vpix * (x as f32 - (self.n as f32 - 1.0) / 2.0)
    }

    /// Velocity-space y coordinate of pixel row `y`.
    pub fn vy(&self, y: usize) -> f32 {
        self.vpix * (y as f32 - (self.n as f32 - 1.0) / 2.0)
    }

    /// `true` iff every pixel is strictly positive.
    pub fn all_positive(&self) -> bool {
        self.data.as_slice().iter().all(|&v| v > 0.0)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(MAP_MAGIC)?;
        w.write_i32::<LittleEndian>(self.nw as i32)?;
        w.write_i32::<LittleEndian>(self.ng as i32)?;
        w.write_i32::<LittleEndian>(self.n as i32)?;
        w.write_f32::<LittleEndian>(self.vpix)?;
        write_f64_slice(w, self.lambda0.as_slice())?;
        write_f32_slice(w, self.gamma.as_slice())?;
        write_f32_slice(w, self.data.as_slice())?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_i32(r, "image cube magic")?;
        if magic != MAP_MAGIC {
            return Err(Error::BadFormat {
                expected: MAP_MAGIC as u32,
                found: magic as u32,
            });
        }
        let nw = read_i32(r, "Nw")? as usize;
        let ng = read_i32(r, "Ng")? as usize;
        let n = read_i32(r, "N")? as usize;
        if nw == 0 || ng == 0 || n == 0 {
            return Err(Error::InputShape(format!(
                "image cube dimensions must be >= 1, found Nw={nw} Ng={ng} N={n}"
            )));
        }
        let vpix = read_f32(r, "vpix")?;
        let lambda0 = read_f64_vec(r, nw, "lambda0")?;
        let gamma = read_f32_vec(r, ng, "gamma")?;
        let data = read_f32_vec(r, nw * ng * n * n, "image data")?;
        Ok(Self {
            nw,
            ng,
            n,
            vpix,
            lambda0: Array1::from_vec(lambda0),
            gamma: Array1::from_vec(gamma),
            data: Array3::from_vec(nw * ng, n, n, data)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Trailed spectrum
// ---------------------------------------------------------------------------

/// A trailed spectrum: `Ns` exposures of `Np` wavelength pixels each.
#[derive(Debug, Clone)]
pub struct TrailedSpectrum {
    pub vpixd: f32,
    pub lambda_d: f64,
    pub time: Array1<f64>,
    pub expose: Array1<f32>,
    pub data: Array2<f32>,
    pub err: Array2<f32>,
}

impl TrailedSpectrum {
    pub fn nspec(&self) -> usize {
        self.data.rows()
    }

    pub fn npix(&self) -> usize {
        self.data.cols()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let ns = self.nspec();
        let np = self.npix();
        if self.time.len() != ns || self.expose.len() != ns {
            return Err(Error::ShapeMismatch {
                what: "trailed spectrum".to_string(),
                detail: format!(
                    "time/expose length must equal Ns={ns}, found time={} expose={}",
                    self.time.len(),
                    self.expose.len()
                ),
            });
        }
        if !self.err.shape_matches(&self.data) {
            return Err(Error::ShapeMismatch {
                what: "trailed spectrum".to_string(),
                detail: format!(
                    "data is {}x{}, err is {}x{}",
                    self.data.rows(),
                    self.data.cols(),
                    self.err.rows(),
                    self.err.cols()
                ),
            });
        }

        w.write_i32::<LittleEndian>(TRAIL_MAGIC)?;
        w.write_f32::<LittleEndian>(self.vpixd)?;
        w.write_f64::<LittleEndian>(self.lambda_d)?;

        write_header(w, &[ns])?;
        write_f64_slice(w, self.time.as_slice())?;

        write_header(w, &[ns])?;
        write_f32_slice(w, self.expose.as_slice())?;

        write_header(w, &[ns, np])?;
        write_f32_slice(w, self.data.as_slice())?;

        write_header(w, &[ns, np])?;
        write_f32_slice(w, self.err.as_slice())?;

        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let magic = read_i32(r, "trail magic")?;
        if magic != TRAIL_MAGIC {
            return Err(Error::BadFormat {
                expected: TRAIL_MAGIC as u32,
                found: magic as u32,
            });
        }
        let vpixd = read_f32(r, "vpixd")?;
        let lambda_d = read_f64(r, "lambda_d")?;

        let time_dims = read_header(r, "time header")?;
        if time_dims.len() != 1 {
            return Err(Error::ShapeMismatch {
                what: "time".to_string(),
                detail: format!("expected rank 1, found rank {}", time_dims.len()),
            });
        }
        let ns = time_dims[0];
        let time = read_f64_vec(r, ns, "time")?;

        let expose_dims = read_header(r, "expose header")?;
        expect_dims("expose", &expose_dims, &[ns])?;
        let expose = read_f32_vec(r, ns, "expose")?;

        let data_dims = read_header(r, "data header")?;
        if data_dims.len() != 2 || data_dims[0] != ns {
            return Err(Error::ShapeMismatch {
                what: "data".to_string(),
                detail: format!("expected [{ns}, Np], found {data_dims:?}"),
            });
        }
        let np = data_dims[1];
        let data = read_f32_vec(r, ns * np, "data")?;

        let err_dims = read_header(r, "err header")?;
        expect_dims("err", &err_dims, &[ns, np])?;
        let err = read_f32_vec(r, ns * np, "err")?;

        Ok(Self {
            vpixd,
            lambda_d,
            time: Array1::from_vec(time),
            expose: Array1::from_vec(expose),
            data: Array2::from_vec(ns, np, data)?,
            err: Array2::from_vec(ns, np, err)?,
        })
    }
}

/// `true` iff two trailed spectra share the same `(Ns, Np)` geometry.
pub fn match_geometry(a: &TrailedSpectrum, b: &TrailedSpectrum) -> bool {
    a.nspec() == b.nspec() && a.npix() == b.npix()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_cube() -> ImageCube {
        let mut cube = ImageCube::zeros(1, 2, 3, 50.0).unwrap();
        cube.lambda0.set(0, 6562.8).unwrap();
        cube.gamma.set(0, -10.0).unwrap();
        cube.gamma.set(1, 10.0).unwrap();
        for i in 0..cube.data.len() {
            cube.data.as_mut_slice()[i] = (i + 1) as f32;
        }
        cube
    }

    fn sample_trail() -> TrailedSpectrum {
        TrailedSpectrum {
            vpixd: 40.0,
            lambda_d: 6562.8,
            time: Array1::from_vec(vec![0.0, 0.1, 0.2]),
            expose: Array1::from_vec(vec![0.01, 0.01, 0.01]),
            data: Array2::from_vec(3, 4, (0..12).map(|i| i as f32).collect()).unwrap(),
            err: Array2::from_vec(3, 4, vec![1.0; 12]).unwrap(),
        }
    }

    #[test]
    fn image_cube_round_trip() {
        let cube = sample_cube();
        let mut buf = Vec::new();
        cube.write(&mut buf).unwrap();
        let back = ImageCube::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.nw, cube.nw);
        assert_eq!(back.ng, cube.ng);
        assert_eq!(back.n, cube.n);
        assert_eq!(back.data.as_slice(), cube.data.as_slice());
        assert_eq!(back.lambda0.as_slice(), cube.lambda0.as_slice());
    }

    #[test]
    fn image_cube_bad_magic_rejected() {
        let cube = sample_cube();
        let mut buf = Vec::new();
        cube.write(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        let err = ImageCube::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::BadFormat { .. }));
    }

    #[test]
    fn image_cube_truncated_rejected() {
        let cube = sample_cube();
        let mut buf = Vec::new();
        cube.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let err = ImageCube::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn trail_round_trip() {
        let trail = sample_trail();
        let mut buf = Vec::new();
        trail.write(&mut buf).unwrap();
        let back = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back.nspec(), trail.nspec());
        assert_eq!(back.npix(), trail.npix());
        assert_eq!(back.data.as_slice(), trail.data.as_slice());
        assert_eq!(back.err.as_slice(), trail.err.as_slice());
    }

    #[test]
    fn trail_bad_magic_rejected() {
        let trail = sample_trail();
        let mut buf = Vec::new();
        trail.write(&mut buf).unwrap();
        buf[0] ^= 0xFF;
        let err = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::BadFormat { .. }));
    }

    #[test]
    fn trail_magic_1235642_is_bad_format() {
        // A magic of 1235642 (one off the real legacy magic 1235641) must be
        // rejected.
        let mut buf = Vec::new();
        buf.write_i32::<LittleEndian>(1_235_642).unwrap();
        buf.write_f32::<LittleEndian>(1.0).unwrap();
        buf.write_f64::<LittleEndian>(1.0).unwrap();
        let err = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::BadFormat { .. }));
    }

    #[test]
    fn trail_truncated_at_last_byte_rejected() {
        let trail = sample_trail();
        let mut buf = Vec::new();
        trail.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let err = TrailedSpectrum::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }

    #[test]
    fn trail_shape_mismatch_between_data_and_err() {
        let mut trail = sample_trail();
        trail.err = Array2::from_vec(2, 4, vec![1.0; 8]).unwrap();
        let mut buf = Vec::new();
        assert!(trail.write(&mut buf).is_err());
    }
}
