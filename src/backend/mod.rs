//! Graph execution backend trait.
//!
//! A [`GraphBackend`] deserializes stage files into [`GraphDesc`]s, hands out
//! backing memory, and runs a graph over raw little-endian slot bytes. The
//! binding layer never looks inside a graph; everything device-specific lives
//! behind this trait.

pub mod host;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::DiffusionError;
use crate::graph::{GraphDesc, Slot};
use crate::tensor::DeviceBuffer;

/// Power/performance hint forwarded to the device around a generation burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceMode {
    Normal,
    Burst,
}

/// Graph execution backend.
///
/// Implementations must be shareable across the threads that load stages in
/// parallel during setup.
pub trait GraphBackend: Send + Sync {
    /// Short backend name for logs and CLI output.
    fn name(&self) -> &str;

    /// Deserialize the stage file at `path`.
    ///
    /// A single file may contain several graphs; they are returned in file
    /// order.
    fn load(&self, path: &Path) -> Result<Vec<GraphDesc>, DiffusionError>;

    /// Allocate a zero-filled buffer of `byte_size` bytes usable as slot memory.
    fn allocate(&self, byte_size: usize) -> Result<DeviceBuffer, DiffusionError> {
        DeviceBuffer::zeroed(byte_size)
    }

    /// Register `buffer` as backing for `slot` of `graph`.
    ///
    /// Host-visible backends need no registration.
    fn bind(&self, _graph: &GraphDesc, _slot: Slot, _buffer: &DeviceBuffer) -> Result<(), DiffusionError> {
        Ok(())
    }

    /// Run `graph` once. `inputs` and `outputs` follow the graph's slot order
    /// and are each exactly the slot's byte size for the bound batch.
    fn execute(
        &self,
        graph: &GraphDesc,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), DiffusionError>;

    /// Apply a performance hint. Default is a no-op.
    fn set_performance_mode(&self, _mode: PerformanceMode) {}
}

/// Select the best available backend.
///
/// Only the host backend ships with this crate; device backends plug in
/// through [`GraphBackend`].
pub fn select_backend() -> Arc<dyn GraphBackend> {
    info!("Selected host backend");
    Arc::new(host::HostBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_backend_is_host() {
        let backend = select_backend();
        assert_eq!(backend.name(), "host");
    }

    #[test]
    fn test_default_allocate_is_zeroed() {
        let backend = select_backend();
        let buf = backend.allocate(32).unwrap();
        assert_eq!(buf.len(), 32);
        assert!(buf.as_bytes().iter().all(|&b| b == 0));
    }
}
