//! Element types and backing memory for stage inputs and outputs.
//!
//! A [`DeviceBuffer`] is a host-visible allocation handed out by a backend.
//! Values are stored little-endian, one [`ElementType`] per buffer, and are
//! moved in and out through the typed [`read_elements`] / [`write_elements`]
//! helpers used by the binding layer.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::DiffusionError;

/// Data type of slot elements. Only 32-bit float and integer types are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Int32,
    UInt32,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            ElementType::Float32 | ElementType::Int32 | ElementType::UInt32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::Float32)
    }
}

/// A host scalar that can be copied into or out of a [`DeviceBuffer`].
pub trait HostElement: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl HostElement for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl HostElement for i32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v.round() as i32
    }
}

impl HostElement for u32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v.round().max(0.0) as u32
    }
}

/// Backing memory for one or more aliased tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceBuffer {
    bytes: Vec<u8>,
}

impl DeviceBuffer {
    /// Allocate a zero-filled buffer of `byte_size` bytes.
    ///
    /// Reports allocator failure as [`DiffusionError::FailedAllocation`]
    /// instead of aborting the process.
    pub fn zeroed(byte_size: usize) -> Result<Self, DiffusionError> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(byte_size).map_err(|e| {
            DiffusionError::failed_allocation(
                "allocate",
                format!("could not allocate a buffer of size {}: {}", byte_size, e),
            )
        })?;
        bytes.resize(byte_size, 0);
        trace!(byte_size, "Allocated device buffer");
        Ok(Self { bytes })
    }

    /// A zero-length placeholder; never handed to a backend.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

fn load(bytes: &[u8], dtype: ElementType, index: usize) -> f64 {
    let off = index * dtype.size();
    let raw = [bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]];
    match dtype {
        ElementType::Float32 => f32::from_le_bytes(raw) as f64,
        ElementType::Int32 => i32::from_le_bytes(raw) as f64,
        ElementType::UInt32 => u32::from_le_bytes(raw) as f64,
    }
}

fn load_f32(bytes: &[u8], index: usize) -> f32 {
    let off = index * 4;
    f32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn store(bytes: &mut [u8], dtype: ElementType, index: usize, value: f64) {
    let off = index * dtype.size();
    let raw = match dtype {
        ElementType::Float32 => (value as f32).to_le_bytes(),
        ElementType::Int32 => (value.round() as i32).to_le_bytes(),
        ElementType::UInt32 => (value.round().max(0.0) as u32).to_le_bytes(),
    };
    bytes[off..off + 4].copy_from_slice(&raw);
}

/// Copy `out.len()` elements of type `dtype` from `bytes` into `out`.
///
/// `bytes` must hold at least `out.len()` elements.
pub fn read_elements<T: HostElement>(bytes: &[u8], dtype: ElementType, out: &mut [T]) {
    debug_assert!(bytes.len() >= out.len() * dtype.size());
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = T::from_f64(load(bytes, dtype, i));
    }
}

/// Copy `src` into `bytes` as elements of type `dtype`, multiplying each
/// value by `scale` and, when `accumulate` is set, adding it to the value
/// already stored.
///
/// Float destinations are computed in `f32` so that blending matches the
/// precision of the surrounding tensors.
pub fn write_elements<T: HostElement>(
    bytes: &mut [u8],
    dtype: ElementType,
    src: &[T],
    scale: f32,
    accumulate: bool,
) {
    debug_assert!(bytes.len() >= src.len() * dtype.size());
    if dtype.is_float() {
        for (i, &v) in src.iter().enumerate() {
            let mut value = (v.to_f64() as f32) * scale;
            if accumulate {
                value += load_f32(bytes, i);
            }
            bytes[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
    } else {
        for (i, &v) in src.iter().enumerate() {
            let mut value = v.to_f64() * scale as f64;
            if accumulate {
                value += load(bytes, dtype, i);
            }
            store(bytes, dtype, i, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::Float32.size(), 4);
        assert_eq!(ElementType::Int32.size(), 4);
        assert_eq!(ElementType::UInt32.size(), 4);
        assert!(ElementType::Float32.is_float());
        assert!(!ElementType::Int32.is_float());
    }

    #[test]
    fn test_element_type_serde_names() {
        let t: ElementType = serde_json::from_str("\"float32\"").unwrap();
        assert_eq!(t, ElementType::Float32);
        let t: ElementType = serde_json::from_str("\"int32\"").unwrap();
        assert_eq!(t, ElementType::Int32);
        assert_eq!(serde_json::to_string(&ElementType::UInt32).unwrap(), "\"uint32\"");
    }

    #[test]
    fn test_zeroed_buffer() {
        let buf = DeviceBuffer::zeroed(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
        assert!(DeviceBuffer::zeroed(0).unwrap().is_empty());
    }

    #[test]
    fn test_zeroed_buffer_reports_allocation_failure() {
        let err = DeviceBuffer::zeroed(usize::MAX).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::FailedAllocation);
    }

    #[test]
    fn test_write_then_read_f32() {
        let mut buf = DeviceBuffer::zeroed(12).unwrap();
        write_elements(buf.as_bytes_mut(), ElementType::Float32, &[1.5f32, -2.0, 3.25], 1.0, false);
        let mut out = [0.0f32; 3];
        read_elements(buf.as_bytes(), ElementType::Float32, &mut out);
        assert_eq!(out, [1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_write_scale_and_accumulate() {
        let mut buf = DeviceBuffer::zeroed(8).unwrap();
        write_elements(buf.as_bytes_mut(), ElementType::Float32, &[2.0f32, 4.0], 7.5, false);
        write_elements(buf.as_bytes_mut(), ElementType::Float32, &[1.0f32, -1.0], -6.5, true);
        let mut out = [0.0f32; 2];
        read_elements(buf.as_bytes(), ElementType::Float32, &mut out);
        // 7.5 * 2 - 6.5 * 1 = 8.5; 7.5 * 4 + 6.5 = 36.5
        assert_eq!(out, [8.5, 36.5]);
    }

    #[test]
    fn test_integer_round_trip_through_int32() {
        let ids: Vec<u32> = vec![49406, 320, 1125, 49407];
        let mut buf = DeviceBuffer::zeroed(ids.len() * 4).unwrap();
        write_elements(buf.as_bytes_mut(), ElementType::Int32, &ids, 1.0, false);
        let mut out = vec![0u32; ids.len()];
        read_elements(buf.as_bytes(), ElementType::Int32, &mut out);
        assert_eq!(out, ids);
    }

    #[test]
    fn test_read_int_as_float() {
        let mut buf = DeviceBuffer::zeroed(8).unwrap();
        write_elements(buf.as_bytes_mut(), ElementType::Int32, &[3i32, -7], 1.0, false);
        let mut out = [0.0f32; 2];
        read_elements(buf.as_bytes(), ElementType::Int32, &mut out);
        assert_eq!(out, [3.0, -7.0]);
    }

    #[test]
    fn test_partial_write_leaves_tail_untouched() {
        let mut buf = DeviceBuffer::zeroed(12).unwrap();
        write_elements(buf.as_bytes_mut(), ElementType::Float32, &[9.0f32; 3], 1.0, false);
        write_elements(buf.as_bytes_mut(), ElementType::Float32, &[1.0f32], 1.0, false);
        let mut out = [0.0f32; 3];
        read_elements(buf.as_bytes(), ElementType::Float32, &mut out);
        assert_eq!(out, [1.0, 9.0, 9.0]);
    }
}
