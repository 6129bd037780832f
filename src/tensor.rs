//! Dense row-major tensors with a single owner.
//!
//! `Tensor` is deliberately not `Clone`: handing one to the pool, the store or
//! the step cache moves it, so a released buffer cannot be touched again.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LstmError, Result};

/// Ordered list of positive dimension sizes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        debug_assert!(!dims.is_empty(), "shape needs at least one dimension");
        debug_assert!(dims.iter().all(|&d| d > 0), "zero-sized dimension in {:?}", dims);
        Shape(dims)
    }

    /// `[rows, cols]`, the only rank the LSTM uses.
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Shape::new(vec![rows, cols])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Element count: product of the dimensions.
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Leading dimensions flattened; a vector is one row.
    pub fn rows(&self) -> usize {
        match self.0.len() {
            0 | 1 => 1,
            n => self.0[..n - 1].iter().product(),
        }
    }

    pub fn cols(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    /// Wrap an existing buffer. Fails when `data.len()` disagrees with `shape`.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.len() {
            return Err(LstmError::shape_mismatch(
                format!("tensor {}", shape),
                shape.len(),
                data.len(),
            ));
        }
        Ok(Tensor { data, shape })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor").field("shape", &self.shape).field("len", &self.data.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_len_and_display() {
        let s = Shape::matrix(3, 4);
        assert_eq!(s.len(), 12);
        assert_eq!(s.rows(), 3);
        assert_eq!(s.cols(), 4);
        assert_eq!(s.to_string(), "[3, 4]");
        let v = Shape::new(vec![7]);
        assert_eq!(v.rows(), 1);
        assert_eq!(v.cols(), 7);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(vec![1.0; 5], Shape::matrix(2, 3)).unwrap_err();
        assert!(matches!(err, LstmError::ShapeMismatch { expected: 6, found: 5, .. }));
        let t = Tensor::from_vec(vec![1.0; 6], Shape::matrix(2, 3)).unwrap();
        assert_eq!(t.len(), 6);
    }
}
