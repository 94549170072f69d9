//! Dense, owning, shape-checked numeric containers.
//!
//! Three shapes cover every buffer the inversion engine touches: a flat
//! sequence, a `rows × cols` matrix, and a `depth × rows × cols` stack of
//! matrices (the image cube's `(w, g)` slices are flattened into `depth`).
//! Storage is row-major and contiguous; shape is tracked explicitly rather
//! than inferred, so a mismatched add/assign fails fast with [`Error::InputShape`]
//! instead of silently operating on the wrong elements.

use crate::error::{Error, Result};

/// Owning 1-D sequence of `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Array1<T> {
    data: Vec<T>,
}

impl<T: Copy + Default> Array1<T> {
    /// A zero-filled sequence of length `n`.
    pub fn zeros(n: usize) -> Self {
        Self {
            data: vec![T::default(); n],
        }
    }
}

impl<T: Copy> Array1<T> {
    /// Wrap an existing row-major buffer.
    pub fn from_vec(data: Vec<T>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn get(&self, i: usize) -> Result<T> {
        self.data.get(i).copied().ok_or_else(|| {
            Error::InputShape(format!("index {i} out of bounds for length {}", self.len()))
        })
    }

    pub fn set(&mut self, i: usize, value: T) -> Result<()> {
        let len = self.data.len();
        let slot = self
            .data
            .get_mut(i)
            .ok_or_else(|| Error::InputShape(format!("index {i} out of bounds for length {len}")))?;
        *slot = value;
        Ok(())
    }

    /// Copy elements out into a raw row-major buffer (identical layout for a 1-D array).
    pub fn copy_to(&self, out: &mut [T]) -> Result<()> {
        shape_eq_len(out.len(), self.len())?;
        out.copy_from_slice(&self.data);
        Ok(())
    }

    /// Overwrite elements from a raw row-major buffer.
    pub fn copy_from(&mut self, src: &[T]) -> Result<()> {
        shape_eq_len(src.len(), self.len())?;
        self.data.copy_from_slice(src);
        Ok(())
    }
}

/// Owning `rows × cols` matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Array2<T> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Array2<T> {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::default(); rows * cols],
        }
    }
}

impl<T: Copy> Array2<T> {
    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        shape_eq_len(data.len(), rows * cols)?;
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape_matches<U>(&self, other: &Array2<U>) -> bool {
        self.rows == other.rows && self.cols == other.cols
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn index(&self, row: usize, col: usize) -> Result<usize> {
        if row >= self.rows || col >= self.cols {
            return Err(Error::InputShape(format!(
                "index ({row}, {col}) out of bounds for {}x{} array",
                self.rows, self.cols
            )));
        }
        Ok(row * self.cols + col)
    }

    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        let i = self.index(row, col)?;
        Ok(self.data[i])
    }

    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        let i = self.index(row, col)?;
        self.data[i] = value;
        Ok(())
    }

    pub fn row(&self, row: usize) -> Result<&[T]> {
        if row >= self.rows {
            return Err(Error::InputShape(format!(
                "row {row} out of bounds for {} rows",
                self.rows
            )));
        }
        let start = row * self.cols;
        Ok(&self.data[start..start + self.cols])
    }

    pub fn row_mut(&mut self, row: usize) -> Result<&mut [T]> {
        if row >= self.rows {
            return Err(Error::InputShape(format!(
                "row {row} out of bounds for {} rows",
                self.rows
            )));
        }
        let start = row * self.cols;
        Ok(&mut self.data[start..start + self.cols])
    }

    pub fn copy_to(&self, out: &mut [T]) -> Result<()> {
        shape_eq_len(out.len(), self.len())?;
        out.copy_from_slice(&self.data);
        Ok(())
    }

    pub fn copy_from(&mut self, src: &[T]) -> Result<()> {
        shape_eq_len(src.len(), self.len())?;
        self.data.copy_from_slice(src);
        Ok(())
    }
}

/// Owning `depth × rows × cols` stack of matrices.
#[derive(Debug, Clone, PartialEq)]
pub struct Array3<T> {
    depth: usize,
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Copy + Default> Array3<T> {
    pub fn zeros(depth: usize, rows: usize, cols: usize) -> Self {
        Self {
            depth,
            rows,
            cols,
            data: vec![T::default(); depth * rows * cols],
        }
    }
}

impl<T: Copy> Array3<T> {
    pub fn from_vec(depth: usize, rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        shape_eq_len(data.len(), depth * rows * cols)?;
        Ok(Self {
            depth,
            rows,
            cols,
            data,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn index(&self, d: usize, row: usize, col: usize) -> Result<usize> {
        if d >= self.depth || row >= self.rows || col >= self.cols {
            return Err(Error::InputShape(format!(
                "index ({d}, {row}, {col}) out of bounds for {}x{}x{} array",
                self.depth, self.rows, self.cols
            )));
        }
        Ok((d * self.rows + row) * self.cols + col)
    }

    pub fn get(&self, d: usize, row: usize, col: usize) -> Result<T> {
        let i = self.index(d, row, col)?;
        Ok(self.data[i])
    }

    pub fn set(&mut self, d: usize, row: usize, col: usize, value: T) -> Result<()> {
        let i = self.index(d, row, col)?;
        self.data[i] = value;
        Ok(())
    }

    /// The `rows × cols` slice at depth `d`.
    pub fn slice(&self, d: usize) -> Result<&[T]> {
        if d >= self.depth {
            return Err(Error::InputShape(format!(
                "slice {d} out of bounds for depth {}",
                self.depth
            )));
        }
        let n = self.rows * self.cols;
        let start = d * n;
        Ok(&self.data[start..start + n])
    }

    pub fn slice_mut(&mut self, d: usize) -> Result<&mut [T]> {
        if d >= self.depth {
            return Err(Error::InputShape(format!(
                "slice {d} out of bounds for depth {}",
                self.depth
            )));
        }
        let n = self.rows * self.cols;
        let start = d * n;
        Ok(&mut self.data[start..start + n])
    }

    pub fn copy_to(&self, out: &mut [T]) -> Result<()> {
        shape_eq_len(out.len(), self.len())?;
        out.copy_from_slice(&self.data);
        Ok(())
    }

    pub fn copy_from(&mut self, src: &[T]) -> Result<()> {
        shape_eq_len(src.len(), self.len())?;
        self.data.copy_from_slice(src);
        Ok(())
    }
}

fn shape_eq_len(found: usize, expected: usize) -> Result<()> {
    if found != expected {
        return Err(Error::InputShape(format!(
            "expected {expected} elements, found {found}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// f32 arithmetic: scalar scale, elementwise add, fused scalar*array add.
// ---------------------------------------------------------------------------

impl Array1<f32> {
    pub fn scale(&mut self, s: f32) {
        for v in &mut self.data {
            *v *= s;
        }
    }

    pub fn add_assign_array(&mut self, other: &Array1<f32>) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::InputShape(format!(
                "add_assign_array: length {} vs {}",
                self.len(),
                other.len()
            )));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }

    /// `self += scalar * other`.
    pub fn add_scaled_assign(&mut self, scalar: f32, other: &Array1<f32>) -> Result<()> {
        if self.len() != other.len() {
            return Err(Error::InputShape(format!(
                "add_scaled_assign: length {} vs {}",
                self.len(),
                other.len()
            )));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scalar * *b;
        }
        Ok(())
    }
}

impl Array2<f32> {
    pub fn scale(&mut self, s: f32) {
        for v in &mut self.data {
            *v *= s;
        }
    }

    pub fn add_assign_array(&mut self, other: &Array2<f32>) -> Result<()> {
        if !self.shape_matches(other) {
            return Err(Error::InputShape(format!(
                "add_assign_array: {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }

    /// `self += scalar * other`.
    pub fn add_scaled_assign(&mut self, scalar: f32, other: &Array2<f32>) -> Result<()> {
        if !self.shape_matches(other) {
            return Err(Error::InputShape(format!(
                "add_scaled_assign: {}x{} vs {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scalar * *b;
        }
        Ok(())
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }
}

impl Array3<f32> {
    pub fn scale(&mut self, s: f32) {
        for v in &mut self.data {
            *v *= s;
        }
    }

    pub fn add_assign_array(&mut self, other: &Array3<f32>) -> Result<()> {
        if self.depth != other.depth || self.rows != other.rows || self.cols != other.cols {
            return Err(Error::InputShape("add_assign_array: shape mismatch".into()));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += *b;
        }
        Ok(())
    }

    /// `self += scalar * other`, used to accumulate a Gaussian spot into a γ-slice.
    pub fn add_scaled_assign(&mut self, scalar: f32, other: &Array3<f32>) -> Result<()> {
        if self.depth != other.depth || self.rows != other.rows || self.cols != other.cols {
            return Err(Error::InputShape(
                "add_scaled_assign: shape mismatch".into(),
            ));
        }
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += scalar * *b;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array2_get_set_roundtrip() {
        let mut a = Array2::<f32>::zeros(3, 4);
        a.set(1, 2, 7.5).unwrap();
        assert_eq!(a.get(1, 2).unwrap(), 7.5);
        assert_eq!(a.get(0, 0).unwrap(), 0.0);
    }

    #[test]
    fn array2_out_of_bounds_is_input_shape_error() {
        let a = Array2::<f32>::zeros(2, 2);
        assert!(matches!(a.get(5, 0), Err(Error::InputShape(_))));
    }

    #[test]
    fn array2_copy_roundtrip() {
        let src = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut a = Array2::<f32>::zeros(2, 2);
        a.copy_from(&src).unwrap();
        let mut out = vec![0.0f32; 4];
        a.copy_to(&mut out).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn array2_add_scaled_assign() {
        let mut a = Array2::<f32>::zeros(2, 2);
        let mut b = Array2::<f32>::zeros(2, 2);
        b.fill(2.0);
        a.add_scaled_assign(3.0, &b).unwrap();
        assert!(a.as_slice().iter().all(|&v| v == 6.0));
    }

    #[test]
    fn array3_slice_access() {
        let mut a = Array3::<f32>::zeros(2, 2, 2);
        a.set(1, 0, 1, 9.0).unwrap();
        assert_eq!(a.slice(1).unwrap()[1], 9.0);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut a = Array2::<f32>::zeros(2, 2);
        let b = Array2::<f32>::zeros(3, 3);
        assert!(a.add_assign_array(&b).is_err());
    }
}
