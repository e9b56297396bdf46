//! Row-major tensor storage.
//!
//! Every value moving through the engine (layer outputs, gradients, dataset
//! records) is a `Tensor`: a flat `f32` buffer plus a shape whose leading
//! dimension counts records. A network works on rank-2 tensors
//! `(records, features)`; the dataset store accepts any record shape.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Named tensors keyed by layer, input or dataset key.
pub type TensorMap = BTreeMap<String, Tensor>;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor from a shape and a row-major buffer.
    pub fn from_shape_vec(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        if shape.is_empty() {
            return Err(Error::InvalidShape(
                "tensor rank must be >= 1".to_owned(),
            ));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::InvalidShape(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A `(rows, cols)` matrix.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        Self::from_shape_vec(vec![rows, cols], data)
    }

    /// A single-record `(1, n)` tensor.
    pub fn row_vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![1, data.len()],
            data,
        }
    }

    /// A `(n, 1)` column, one scalar per record.
    pub fn column(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len(), 1],
            data,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: &[usize], value: f32) -> Self {
        debug_assert!(!shape.is_empty());
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    /// Copy per-record rows into contiguous storage.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Err(Error::InvalidData("rows must not be empty".to_owned()));
        };
        let cols = first.len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(Error::InvalidShape(format!(
                    "row {i} has len {}, expected {cols}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Self::matrix(rows.len(), cols, data)
    }

    /// One-hot rows: record `i` has a single 1 at `indices[i]`.
    pub fn one_hot(indices: &[usize], classes: usize) -> Result<Self> {
        let mut out = Self::zeros(&[indices.len(), classes]);
        for (i, &k) in indices.iter().enumerate() {
            if k >= classes {
                return Err(Error::InvalidData(format!(
                    "index {k} out of range for {classes} classes"
                )));
            }
            out.data[i * classes + k] = 1.0;
        }
        Ok(out)
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape of one record (the shape without the leading dimension).
    #[inline]
    pub fn record_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    /// Number of records.
    #[inline]
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Number of scalars per record.
    #[inline]
    pub fn record_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        let n = self.record_len();
        &self.data[i * n..(i + 1) * n]
    }

    #[inline]
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let n = self.record_len();
        &mut self.data[i * n..(i + 1) * n]
    }

    /// Scalar of a `(rows, 1)` column or any single-element record.
    #[inline]
    pub fn scalar(&self, i: usize) -> f32 {
        self.row(i)[0]
    }

    /// View each record as a flat feature vector: `(rows, record_len)`.
    pub fn flatten_records(&self) -> Tensor {
        Tensor {
            shape: vec![self.rows(), self.record_len()],
            data: self.data.clone(),
        }
    }

    /// Same data, new record shape.
    pub fn reshape_records(mut self, record_shape: &[usize]) -> Result<Tensor> {
        let n: usize = record_shape.iter().product();
        if n != self.record_len() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape records {:?} into {record_shape:?}",
                self.record_shape()
            )));
        }
        let rows = self.rows();
        self.shape = std::iter::once(rows)
            .chain(record_shape.iter().copied())
            .collect();
        Ok(self)
    }

    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        assert!(start <= end && end <= self.rows(), "row range out of bounds");
        let n = self.record_len();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Tensor {
            shape,
            data: self.data[start * n..end * n].to_vec(),
        }
    }

    pub fn select_rows(&self, indices: &[usize]) -> Tensor {
        let n = self.record_len();
        let mut data = Vec::with_capacity(indices.len() * n);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        let mut shape = self.shape.clone();
        shape[0] = indices.len();
        Tensor { shape, data }
    }

    /// Concatenate along the feature axis; every part must have the same
    /// number of records. Records are flattened first.
    pub fn hconcat(parts: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            return Err(Error::InvalidData("nothing to concatenate".to_owned()));
        };
        let rows = first.rows();
        if let Some(bad) = parts.iter().find(|t| t.rows() != rows) {
            return Err(Error::InvalidShape(format!(
                "cannot concatenate {} records with {rows}",
                bad.rows()
            )));
        }
        let cols: usize = parts.iter().map(|t| t.record_len()).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for part in parts {
                data.extend_from_slice(part.row(i));
            }
        }
        Tensor::matrix(rows, cols, data)
    }

    /// Concatenate along the record axis; record shapes must agree.
    pub fn vstack(parts: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            return Err(Error::InvalidData("nothing to stack".to_owned()));
        };
        let record_shape = first.record_shape();
        let mut rows = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.record_shape() != record_shape {
                return Err(Error::InvalidShape(format!(
                    "cannot stack records {:?} onto {record_shape:?}",
                    part.record_shape()
                )));
            }
            rows += part.rows();
            data.extend_from_slice(&part.data);
        }
        let shape = std::iter::once(rows)
            .chain(record_shape.iter().copied())
            .collect();
        Tensor::from_shape_vec(shape, data)
    }

    /// Stack single observations (any shape) into one `(n, len)` batch.
    pub fn stack_flat(parts: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            return Err(Error::InvalidData("nothing to stack".to_owned()));
        };
        let cols = first.len();
        let mut data = Vec::with_capacity(parts.len() * cols);
        for part in parts {
            if part.len() != cols {
                return Err(Error::InvalidShape(format!(
                    "observation has {} values, expected {cols}",
                    part.len()
                )));
            }
            data.extend_from_slice(&part.data);
        }
        Tensor::matrix(parts.len(), cols, data)
    }

    /// Elementwise `self += other`.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "add_assign shape mismatch");
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}
