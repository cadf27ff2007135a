//! Host-side tensor carried by MoE dispatch payloads.
//!
//! The control plane never computes on these values; it only moves them
//! between ranks and hands them to the model executor. A flat typed buffer
//! plus a shape is all the contract needs.

use crate::dtype::{DType, TensorDType};

/// A host-resident tensor: typed element storage plus a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor<T> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: TensorDType> HostTensor<T> {
    /// Create a tensor from a flat buffer and a shape.
    ///
    /// # Panics
    /// Panics if the data length doesn't match the product of the shape
    /// dimensions.
    #[must_use]
    pub fn new(data: Vec<T>, shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        Self {
            data,
            shape: shape.to_vec(),
        }
    }

    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: vec![T::default(); numel],
            shape: shape.to_vec(),
        }
    }

    /// Element dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Shape as a slice of dimensions.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the tensor, returning the flat buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Row `i` of a tensor whose leading dimension indexes rows.
    ///
    /// # Panics
    /// Panics if the tensor is 0-dimensional or `i` is out of range.
    #[must_use]
    pub fn row(&self, i: usize) -> &[T] {
        assert!(!self.shape.is_empty(), "row() needs a leading dimension");
        let width: usize = self.shape[1..].iter().product();
        &self.data[i * width..(i + 1) * width]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_and_rows() {
        let t = HostTensor::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.row(0), &[1.0, 2.0, 3.0]);
        assert_eq!(t.row(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn zeros_fills_the_shape() {
        let t: HostTensor<i8> = HostTensor::zeros(&[3, 4]);
        assert_eq!(t.numel(), 12);
        assert!(t.as_slice().iter().all(|&v| v == 0));
        assert_eq!(t.dtype(), DType::I8);
    }

    #[test]
    #[should_panic(expected = "data len")]
    fn mismatched_shape_panics() {
        let _ = HostTensor::new(vec![0u32; 5], &[2, 3]);
    }
}
