//! Tensor metadata and host-side tensor storage

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a binding
///
/// Discriminants match TensorRT's `nvinfer1::DataType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    Int8,
    Int32,
    Bool,
    UInt8,
    Fp8,
    BFloat16,
    Int64,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int64 => 8,
            DataType::Int8 | DataType::Bool | DataType::UInt8 | DataType::Fp8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::Int8 => "int8",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
            DataType::UInt8 => "uint8",
            DataType::Fp8 => "fp8",
            DataType::BFloat16 => "bfloat16",
            DataType::Int64 => "int64",
        }
    }

    pub(crate) fn from_native(code: i32) -> Result<Self> {
        Ok(match code {
            0 => DataType::Float32,
            1 => DataType::Float16,
            2 => DataType::Int8,
            3 => DataType::Int32,
            4 => DataType::Bool,
            5 => DataType::UInt8,
            6 => DataType::Fp8,
            7 => DataType::BFloat16,
            8 => DataType::Int64,
            other => return Err(Error::Format(format!("unsupported tensor data type {}", other))),
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorIo {
    Input,
    Output,
}

/// A named, typed, fixed-shape tensor slot declared by an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub io: TensorIo,
}

impl BindingSpec {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes needed to hold the whole tensor
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    pub fn is_input(&self) -> bool {
        self.io == TensorIo::Input
    }
}

pub(crate) fn describe(dtype: DataType, shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
    format!("{}[{}]", dtype, dims.join(","))
}

/// Tensor data in host memory, stored as little-endian bytes
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    dtype: DataType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled tensor
    pub fn zeros(dtype: DataType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size();
        HostTensor {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }

    /// Wrap raw bytes; the length must match `shape` and `dtype`
    pub fn from_bytes(dtype: DataType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "{} needs {} bytes, got {}",
                describe(dtype, &shape),
                expected,
                data.len()
            )));
        }
        Ok(HostTensor { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Float32, shape, data)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(DataType::Int32, shape, data)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Decode a `float32` tensor
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.expect_dtype(DataType::Float32)?;
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Decode an `int32` tensor
    pub fn to_i32_vec(&self) -> Result<Vec<i32>> {
        self.expect_dtype(DataType::Int32)?;
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// `dtype[d0,d1,...]`, as used in error messages
    pub fn describe(&self) -> String {
        describe(self.dtype, &self.shape)
    }

    pub(crate) fn matches(&self, spec: &BindingSpec) -> bool {
        self.dtype == spec.dtype && self.shape == spec.shape
    }

    fn expect_dtype(&self, dtype: DataType) -> Result<()> {
        if self.dtype != dtype {
            return Err(Error::InvalidArgument(format!(
                "expected a {} tensor, found {}",
                dtype,
                self.describe()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_codes() {
        for code in 0..=8 {
            assert!(DataType::from_native(code).is_ok());
        }
        assert_eq!(DataType::from_native(3).unwrap(), DataType::Int32);
        assert!(matches!(DataType::from_native(42), Err(Error::Format(_))));
    }

    #[test]
    fn test_binding_byte_size() {
        let spec = BindingSpec {
            name: "input".to_string(),
            shape: vec![1, 3, 224, 224],
            dtype: DataType::Float16,
            io: TensorIo::Input,
        };
        assert_eq!(spec.element_count(), 150_528);
        assert_eq!(spec.byte_size(), 301_056);
        assert!(spec.is_input());
    }

    #[test]
    fn test_host_tensor_length_checked() {
        let err = HostTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let t = HostTensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.as_bytes().len(), 16);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(t.to_i32_vec().is_err());
    }

    #[test]
    fn test_describe() {
        let t = HostTensor::zeros(DataType::Int32, vec![1, 1000]);
        assert_eq!(t.describe(), "int32[1,1000]");
    }

    #[test]
    fn test_dtype_serializes_lowercase() {
        let json = serde_json::to_string(&DataType::BFloat16).unwrap();
        assert_eq!(json, "\"bfloat16\"");
    }
}
