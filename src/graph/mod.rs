//! Loaded pipeline stages and their declared input/output slots.
//!
//! A [`GraphDesc`] is what a backend hands back after deserializing a stage:
//! a name, ordered input and output [`SlotSpec`]s, and an opaque native handle
//! the backend uses to execute it. Memory is never owned by a slot; see
//! [`binding::Bindings`] for the tensor arena that backs slots.

pub mod binding;

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tensor::ElementType;

pub use binding::{Bindings, BufferId, Graph, GraphId, TensorId};

/// Declared shape and element type of one graph input or output.
///
/// The leading axis of `shape` is the batch axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: ElementType,
}

impl SlotSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: ElementType) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
        }
    }

    /// Number of elements per batch entry (the batch axis is excluded), or
    /// `None` if the product overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().skip(1).try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Bytes required to hold `batch` entries of this slot, or `None` on
    /// overflow.
    pub fn byte_size(&self, batch: usize) -> Option<usize> {
        self.element_count()?
            .checked_mul(batch)?
            .checked_mul(self.dtype.size())
    }
}

/// Position within a graph's input or output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Input(usize),
    Output(usize),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Input(i) => write!(f, "input {}", i),
            Slot::Output(i) => write!(f, "output {}", i),
        }
    }
}

/// A deserialized stage as returned by [`crate::backend::GraphBackend::load`].
pub struct GraphDesc {
    pub name: String,
    pub inputs: Vec<SlotSpec>,
    pub outputs: Vec<SlotSpec>,
    native: Box<dyn Any + Send + Sync>,
}

impl GraphDesc {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<SlotSpec>,
        outputs: Vec<SlotSpec>,
        native: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
            native,
        }
    }

    /// Spec of `slot`, or `None` if the index is out of range.
    pub fn slot_spec(&self, slot: Slot) -> Option<&SlotSpec> {
        match slot {
            Slot::Input(i) => self.inputs.get(i),
            Slot::Output(i) => self.outputs.get(i),
        }
    }

    pub fn input_named(&self, name: &str) -> Option<Slot> {
        self.inputs.iter().position(|s| s.name == name).map(Slot::Input)
    }

    pub fn output_named(&self, name: &str) -> Option<Slot> {
        self.outputs.iter().position(|s| s.name == name).map(Slot::Output)
    }

    /// Downcast the backend-native handle.
    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.native.downcast_ref::<T>()
    }
}

impl fmt::Debug for GraphDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphDesc")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> GraphDesc {
        GraphDesc::new(
            "unet_head",
            vec![
                SlotSpec::new("hidden", vec![1, 320, 64, 64], ElementType::Float32),
                SlotSpec::new("time_embedding", vec![1, 1280], ElementType::Float32),
            ],
            vec![SlotSpec::new("noise", vec![1, 4, 64, 64], ElementType::Float32)],
            Box::new(42u32),
        )
    }

    #[test]
    fn test_element_count_excludes_batch_axis() {
        let spec = SlotSpec::new("latent", vec![2, 4, 64, 64], ElementType::Float32);
        assert_eq!(spec.element_count(), Some(4 * 64 * 64));
        assert_eq!(spec.byte_size(1), Some(4 * 64 * 64 * 4));
        assert_eq!(spec.byte_size(2), Some(2 * 4 * 64 * 64 * 4));
    }

    #[test]
    fn test_scalar_slot_has_one_element() {
        let spec = SlotSpec::new("timestep", vec![1], ElementType::Float32);
        assert_eq!(spec.element_count(), Some(1));
        assert_eq!(spec.byte_size(1), Some(4));
    }

    #[test]
    fn test_sizes_overflow_to_none() {
        let spec = SlotSpec::new("huge", vec![1, 1 << 32, 1 << 32], ElementType::Float32);
        assert_eq!(spec.element_count(), None);
        assert_eq!(spec.byte_size(1), None);

        let spec = SlotSpec::new("wide", vec![1, usize::MAX / 2], ElementType::Float32);
        assert!(spec.element_count().is_some());
        assert_eq!(spec.byte_size(1), None);
    }

    #[test]
    fn test_slot_lookup_by_name() {
        let g = desc();
        assert_eq!(g.input_named("time_embedding"), Some(Slot::Input(1)));
        assert_eq!(g.output_named("noise"), Some(Slot::Output(0)));
        assert_eq!(g.input_named("noise"), None);
        assert!(g.slot_spec(Slot::Input(2)).is_none());
        assert_eq!(g.slot_spec(Slot::Output(0)).unwrap().name, "noise");
    }

    #[test]
    fn test_native_handle_downcast() {
        let g = desc();
        assert_eq!(g.native::<u32>(), Some(&42));
        assert!(g.native::<String>().is_none());
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(Slot::Input(3).to_string(), "input 3");
        assert_eq!(Slot::Output(0).to_string(), "output 0");
    }
}
