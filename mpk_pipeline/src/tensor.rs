use ndarray::{ArrayD, Axis, IxDyn};
use std::fmt;

/// Dense tensor flowing between transform kernels.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I8(ArrayD<i8>),
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(array) => array.shape(),
            Tensor::I8(array) => array.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn len(&self) -> usize {
        match self {
            Tensor::F32(array) => array.len(),
            Tensor::I8(array) => array.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> &'static str {
        match self {
            Tensor::F32(_) => "float32",
            Tensor::I8(_) => "int8",
        }
    }

    /// Adds a leading batch axis of size one.
    pub fn insert_batch_axis(self) -> Tensor {
        match self {
            Tensor::F32(array) => Tensor::F32(array.insert_axis(Axis(0))),
            Tensor::I8(array) => Tensor::I8(array.insert_axis(Axis(0))),
        }
    }

    pub fn to_f32(&self) -> ArrayD<f32> {
        match self {
            Tensor::F32(array) => array.clone(),
            Tensor::I8(array) => array.mapv(f32::from),
        }
    }

    /// Row-major bytes; f32 values are little-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Tensor::F32(array) => array.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Tensor::I8(array) => array.iter().map(|&v| v as u8).collect(),
        }
    }

    /// Reinterprets the first `count` bytes as a flat int8 tensor.
    pub fn from_i8_bytes(bytes: &[u8], count: usize) -> Tensor {
        let count = count.min(bytes.len());
        let data: Vec<i8> = bytes[..count].iter().map(|&b| b as i8).collect();
        Tensor::I8(ArrayD::from_shape_vec(IxDyn(&[count]), data).unwrap_or_default())
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(array: ArrayD<f32>) -> Self {
        Tensor::F32(array)
    }
}

impl From<ArrayD<i8>> for Tensor {
    fn from(array: ArrayD<i8>) -> Self {
        Tensor::I8(array)
    }
}

/// Kernel input or output: one tensor, or the fan-out of an unpack.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(Tensor),
    List(Vec<Tensor>),
}

impl Value {
    pub fn output_count(&self) -> usize {
        match self {
            Value::Tensor(_) => 1,
            Value::List(tensors) => tensors.len(),
        }
    }

    pub fn into_tensors(self) -> Vec<Tensor> {
        match self {
            Value::Tensor(tensor) => vec![tensor],
            Value::List(tensors) => tensors,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            Value::List(tensors) if tensors.len() == 1 => tensors.first(),
            Value::List(_) => None,
        }
    }

    /// Shape of a single tensor, or of the first list entry.
    pub fn shape_summary(&self) -> String {
        match self {
            Value::Tensor(tensor) => format!("{:?}", tensor.shape()),
            Value::List(tensors) => match tensors.first() {
                Some(first) => format!("list of {} starting {:?}", tensors.len(), first.shape()),
                None => "empty list".to_string(),
            },
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Value::Tensor(tensor)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tensor {:?}", self.dtype(), self.shape())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_bytes_keep_sign() {
        let tensor = Tensor::from_i8_bytes(&[0xff, 0x01, 0x80, 0x00], 3);
        assert_eq!(tensor.shape(), &[3]);
        assert_eq!(tensor.to_bytes(), vec![0xff, 0x01, 0x80]);
        assert_eq!(tensor.to_f32().as_slice().unwrap(), &[-1.0, 1.0, -128.0]);
    }

    #[test]
    fn test_batch_axis() {
        let tensor = Tensor::F32(ArrayD::zeros(IxDyn(&[4, 4, 3])));
        assert_eq!(tensor.insert_batch_axis().shape(), &[1, 4, 4, 3]);
    }
}
