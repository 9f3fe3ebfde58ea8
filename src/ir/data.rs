//! Owned constant payloads.
//!
//! A tensor either carries one of these (a compile-time constant: weight,
//! bias, batch-norm parameter, folded expression) or none (a runtime
//! activation). The closed enum keeps payload element types aligned with
//! [`DataType`] so passes can match exhaustively.

use bytemuck::cast_slice;

use super::DataType;

/// Constant tensor payload.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type of the payload.
    pub fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::I32(_) => DataType::I32,
            TensorData::I8(_) => DataType::I8,
            TensorData::U8(_) => DataType::U8,
        }
    }

    /// Little-endian byte view of the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => cast_slice(v).to_vec(),
            TensorData::I32(v) => cast_slice(v).to_vec(),
            TensorData::I8(v) => cast_slice(v).to_vec(),
            TensorData::U8(v) => v.clone(),
        }
    }

    /// Float view. Integer payloads are widened; used by folding and fusion,
    /// which only run on pre-quantization graphs.
    pub fn as_f32(&self) -> Vec<f32> {
        match self {
            TensorData::F32(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I8(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::U8(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Minimum and maximum element, as floats. Empty payload yields (0, 0).
    pub fn min_max(&self) -> (f32, f32) {
        let values = self.as_f32();
        if values.is_empty() {
            return (0.0, 0.0);
        }
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        for &v in &values {
            min = min.min(v);
            max = max.max(v);
        }
        (min, max)
    }
}

/// Elementwise binary op over float payloads with scalar broadcast.
///
/// Operands must be equal length, or one of them length 1.
pub fn elementwise(
    lhs: &[f32],
    rhs: &[f32],
    op: impl Fn(f32, f32) -> f32,
) -> Result<Vec<f32>, String> {
    if lhs.len() == rhs.len() {
        Ok(lhs.iter().zip(rhs).map(|(&a, &b)| op(a, b)).collect())
    } else if rhs.len() == 1 {
        Ok(lhs.iter().map(|&a| op(a, rhs[0])).collect())
    } else if lhs.len() == 1 {
        Ok(rhs.iter().map(|&b| op(lhs[0], b)).collect())
    } else {
        Err(format!(
            "shape mismatch in elementwise op: {} vs {} elements",
            lhs.len(),
            rhs.len()
        ))
    }
}

/// Permute a row-major tensor's axes. Returns the transposed data and shape.
pub fn transpose(data: &[f32], shape: &[usize], perm: &[usize]) -> Result<(Vec<f32>, Vec<usize>), String> {
    let rank = shape.len();
    if perm.len() != rank {
        return Err(format!(
            "transpose permutation rank {} does not match tensor rank {}",
            perm.len(),
            rank
        ));
    }
    let size: usize = shape.iter().product();
    if data.len() != size {
        return Err(format!(
            "transpose payload has {} elements, shape implies {}",
            data.len(),
            size
        ));
    }

    let new_shape: Vec<usize> = perm.iter().map(|&p| shape[p]).collect();

    // Row-major strides for source and destination.
    let mut src_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        src_strides[i] = src_strides[i + 1] * shape[i + 1];
    }
    let mut dst_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        dst_strides[i] = dst_strides[i + 1] * new_shape[i + 1];
    }

    let mut out = vec![0.0f32; size];
    let mut index = vec![0usize; rank];
    for &v in data {
        let mut dst = 0;
        for (d, &p) in perm.iter().enumerate() {
            dst += index[p] * dst_strides[d];
        }
        out[dst] = v;

        // Advance the row-major multi-index.
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok((out, new_shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_view_is_little_endian() {
        let data = TensorData::F32(vec![1.0]);
        assert_eq!(data.to_bytes(), 1.0f32.to_le_bytes().to_vec());
        let data = TensorData::I32(vec![-2]);
        assert_eq!(data.to_bytes(), (-2i32).to_le_bytes().to_vec());
    }

    #[test]
    fn test_elementwise_broadcast_scalar() {
        let out = elementwise(&[1.0, 2.0, 3.0], &[10.0], |a, b| a * b).unwrap();
        assert_eq!(out, vec![10.0, 20.0, 30.0]);
        assert!(elementwise(&[1.0, 2.0], &[1.0, 2.0, 3.0], |a, b| a + b).is_err());
    }

    #[test]
    fn test_transpose_2d() {
        // 2x3 -> 3x2
        let data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let (out, shape) = transpose(&data, &[2, 3], &[1, 0]).unwrap();
        assert_eq!(shape, vec![3, 2]);
        assert_eq!(out, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_min_max() {
        let data = TensorData::F32(vec![-3.0, 0.5, 2.0]);
        assert_eq!(data.min_max(), (-3.0, 2.0));
    }
}
