//! Closed error taxonomy for the inversion engine.
//!
//! Every fatal condition the engine can hit (§7 of the design) maps to one
//! variant here instead of a hand-rolled string exception. The driver is the
//! only consumer that should ever print one of these — library code always
//! propagates with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Dimensions inconsistent: a non-square image, a default that doesn't
    /// match the image it's derived from, a geometry mismatch between an
    /// image cube and a trailed spectrum, etc.
    #[error("input shape invalid: {0}")]
    InputShape(String),

    /// A file's magic number didn't match what the reader expected.
    #[error("bad format: expected magic {expected:#x}, found {found:#x}")]
    BadFormat { expected: u32, found: u32 },

    /// A read ran out of bytes before the declared shape was satisfied.
    #[error("truncated while reading {what}: needed {needed} more byte(s)")]
    Truncated { what: String, needed: usize },

    /// Two arrays that are supposed to agree (e.g. `data` and `err`, or a
    /// declared array length and its header) do not.
    #[error("shape mismatch in {what}: {detail}")]
    ShapeMismatch { what: String, detail: String },

    /// A voxel was `<= 0` on entry to an iteration or after a step; entropy
    /// is undefined there.
    #[error("domain violation: voxel {index} = {value} is not strictly positive")]
    DomainViolation { index: usize, value: f32 },

    /// The 3×3 MEM subproblem was not positive-definite, or a NaN appeared
    /// in a gradient.
    #[error("numeric failure: {0}")]
    NumericFailure(String),

    /// An invariant that should be impossible to violate was violated.
    #[error("unreachable invariant breach: {0}")]
    Unreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
