//! Tensor arena and slot binding table.
//!
//! [`Bindings`] owns every loaded graph, every tensor and every backing
//! buffer. Slots never own memory: each slot holds at most one *active*
//! [`TensorId`], and a tensor is just a (buffer, target slot, batch) triple.
//! Several tensors may share one buffer, which is how stages are wired
//! together without copies (an output slot of one stage and an input slot of
//! the next alias the same buffer) and how alternative inputs are switched in
//! O(1) (activate a different tensor against the same slot).
//!
//! All mutation goes through `&mut self`, so a graph's bindings can never be
//! changed while it executes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::backend::GraphBackend;
use crate::error::DiffusionError;
use crate::tensor::{read_elements, write_elements, DeviceBuffer, HostElement};

use super::{GraphDesc, Slot, SlotSpec};

/// Index of a graph inside a [`Bindings`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(usize);

/// Index of a tensor inside a [`Bindings`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

/// Index of a backing buffer inside a [`Bindings`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

/// A loaded graph plus its slot → active tensor table.
#[derive(Debug)]
pub struct Graph {
    desc: GraphDesc,
    active_inputs: Vec<Option<TensorId>>,
    active_outputs: Vec<Option<TensorId>>,
    /// Cleared whenever an activation changes; execution re-verifies.
    verified: bool,
}

impl Graph {
    fn new(desc: GraphDesc) -> Self {
        let active_inputs = vec![None; desc.inputs.len()];
        let active_outputs = vec![None; desc.outputs.len()];
        Self {
            desc,
            active_inputs,
            active_outputs,
            verified: false,
        }
    }

    pub fn desc(&self) -> &GraphDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn num_inputs(&self) -> usize {
        self.desc.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.desc.outputs.len()
    }

    /// Tensor currently backing `slot`, if any.
    pub fn active(&self, slot: Slot) -> Option<TensorId> {
        match slot {
            Slot::Input(i) => self.active_inputs.get(i).copied().flatten(),
            Slot::Output(i) => self.active_outputs.get(i).copied().flatten(),
        }
    }

    fn table_mut(&mut self, slot: Slot) -> &mut Option<TensorId> {
        match slot {
            Slot::Input(i) => &mut self.active_inputs[i],
            Slot::Output(i) => &mut self.active_outputs[i],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TensorEntry {
    buffer: BufferId,
    graph: GraphId,
    slot: Slot,
    batch: usize,
}

/// Arena of graphs, tensors and buffers for one pipeline.
pub struct Bindings {
    backend: Arc<dyn GraphBackend>,
    graphs: Vec<Graph>,
    tensors: Vec<TensorEntry>,
    buffers: Vec<DeviceBuffer>,
}

impl Bindings {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            backend,
            graphs: Vec::new(),
            tensors: Vec::new(),
            buffers: Vec::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    /// Take ownership of a loaded graph. Its slots start with no active tensor.
    pub fn add_graph(&mut self, desc: GraphDesc) -> GraphId {
        let id = GraphId(self.graphs.len());
        debug!(
            graph = %desc.name,
            inputs = desc.inputs.len(),
            outputs = desc.outputs.len(),
            "Registered graph"
        );
        self.graphs.push(Graph::new(desc));
        id
    }

    /// The graph registered as `id`, or `None` for an id from another arena.
    pub fn graph(&self, id: GraphId) -> Option<&Graph> {
        self.graphs.get(id.0)
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn spec(&self, graph: GraphId, slot: Slot, op: &'static str) -> Result<&SlotSpec, DiffusionError> {
        let g = self
            .graphs
            .get(graph.0)
            .ok_or_else(|| DiffusionError::invalid_argument(op, format!("unknown graph {:?}", graph)))?;
        g.desc.slot_spec(slot).ok_or_else(|| {
            DiffusionError::invalid_argument(
                op,
                format!(
                    "{} out of range for graph '{}' ({} inputs, {} outputs)",
                    slot,
                    g.name(),
                    g.num_inputs(),
                    g.num_outputs()
                ),
            )
        })
    }

    /// Bytes needed for `batch` entries of `slot`, rejecting shapes whose
    /// size does not fit in `usize`.
    fn byte_size(
        &self,
        graph: GraphId,
        slot: Slot,
        batch: usize,
        op: &'static str,
    ) -> Result<usize, DiffusionError> {
        let spec = self.spec(graph, slot, op)?;
        spec.byte_size(batch).ok_or_else(|| {
            DiffusionError::invalid_argument(
                op,
                format!(
                    "{} '{}' with shape {:?} and batch {} is too large to address",
                    slot, spec.name, spec.shape, batch
                ),
            )
        })
    }

    /// Elements `tensor` holds (slot element count times batch).
    fn count(&self, entry: &TensorEntry, op: &'static str) -> Result<usize, DiffusionError> {
        let spec = self.spec(entry.graph, entry.slot, op)?;
        spec.element_count()
            .and_then(|n| n.checked_mul(entry.batch))
            .ok_or_else(|| {
                DiffusionError::invalid_argument(
                    op,
                    format!("{} '{}' with shape {:?} is too large to address", entry.slot, spec.name, spec.shape),
                )
            })
    }

    fn entry(&self, tensor: TensorId, op: &'static str) -> Result<TensorEntry, DiffusionError> {
        self.tensors
            .get(tensor.0)
            .copied()
            .ok_or_else(|| DiffusionError::invalid_argument(op, format!("unknown tensor {:?}", tensor)))
    }

    /// Allocate fresh backing memory for `slot` of `graph`, sized for `batch`
    /// entries. The new tensor is not active.
    pub fn allocate(
        &mut self,
        graph: GraphId,
        slot: Slot,
        batch: usize,
    ) -> Result<TensorId, DiffusionError> {
        if batch == 0 {
            return Err(DiffusionError::invalid_argument("allocate", "batch size must be at least 1"));
        }
        let byte_size = self.byte_size(graph, slot, batch, "allocate")?;
        let buffer = self.backend.allocate(byte_size)?;
        self.backend.bind(&self.graphs[graph.0].desc, slot, &buffer)?;

        let buffer_id = BufferId(self.buffers.len());
        self.buffers.push(buffer);
        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorEntry {
            buffer: buffer_id,
            graph,
            slot,
            batch,
        });
        trace!(graph = %self.graphs[graph.0].name(), %slot, byte_size, ?id, "Allocated tensor");
        Ok(id)
    }

    /// Create an alias of `tensor`'s memory targeting `slot` of `graph`.
    ///
    /// No bytes are copied. When `activate` is set the alias immediately
    /// becomes the slot's active tensor.
    pub fn bind(
        &mut self,
        graph: GraphId,
        slot: Slot,
        tensor: TensorId,
        activate: bool,
    ) -> Result<TensorId, DiffusionError> {
        let source = self.entry(tensor, "bind")?;
        let required = self.byte_size(graph, slot, source.batch, "bind")?;
        let available = self.buffers[source.buffer.0].len();
        if available < required {
            return Err(DiffusionError::invalid_argument(
                "bind",
                format!(
                    "buffer of {} bytes cannot back {} of graph '{}' ({} bytes required)",
                    available,
                    slot,
                    self.graphs[graph.0].name(),
                    required
                ),
            ));
        }
        self.backend
            .bind(&self.graphs[graph.0].desc, slot, &self.buffers[source.buffer.0])?;

        let id = TensorId(self.tensors.len());
        self.tensors.push(TensorEntry {
            buffer: source.buffer,
            graph,
            slot,
            batch: source.batch,
        });
        trace!(graph = %self.graphs[graph.0].name(), %slot, ?tensor, alias = ?id, "Bound alias");
        if activate {
            self.activate(id)?;
        }
        Ok(id)
    }

    /// Make `tensor` the active backing of its target slot, replacing
    /// whichever tensor was active there before.
    pub fn activate(&mut self, tensor: TensorId) -> Result<(), DiffusionError> {
        let entry = self.entry(tensor, "activate")?;
        let graph = &mut self.graphs[entry.graph.0];
        let current = graph.table_mut(entry.slot);
        if *current != Some(tensor) {
            *current = Some(tensor);
            graph.verified = false;
        }
        Ok(())
    }

    /// Detach `tensor` from its slot if it is the active one there.
    pub fn deactivate(&mut self, tensor: TensorId) -> Result<(), DiffusionError> {
        let entry = self.entry(tensor, "deactivate")?;
        let graph = &mut self.graphs[entry.graph.0];
        let current = graph.table_mut(entry.slot);
        if *current == Some(tensor) {
            *current = None;
            graph.verified = false;
        }
        Ok(())
    }

    pub fn is_active(&self, tensor: TensorId) -> bool {
        match self.tensors.get(tensor.0) {
            Some(entry) => self.graphs[entry.graph.0].active(entry.slot) == Some(tensor),
            None => false,
        }
    }

    /// Buffer backing `tensor`; aliases of one allocation share a buffer id.
    pub fn buffer_of(&self, tensor: TensorId) -> Option<BufferId> {
        self.tensors.get(tensor.0).map(|e| e.buffer)
    }

    /// Number of elements `tensor` holds (slot element count times batch).
    pub fn element_count(&self, tensor: TensorId) -> Result<usize, DiffusionError> {
        let entry = self.entry(tensor, "element_count")?;
        self.count(&entry, "element_count")
    }

    /// Check that `graph` can execute.
    ///
    /// Every slot needs an active tensor, all active tensors must agree on a
    /// single batch size, and no buffer may back an input and an output (or
    /// two outputs) at once. All problems are reported together.
    pub fn verify(&self, graph: GraphId) -> Result<(), DiffusionError> {
        let g = self
            .graphs
            .get(graph.0)
            .ok_or_else(|| DiffusionError::invalid_argument("verify", format!("unknown graph {:?}", graph)))?;

        let mut missing = Vec::new();
        let mut batches = BTreeSet::new();
        let mut input_buffers = BTreeSet::new();
        let mut output_buffers = BTreeSet::new();
        let mut overlapping = Vec::new();

        for (i, spec) in g.desc.inputs.iter().enumerate() {
            match g.active_inputs[i] {
                Some(t) => {
                    let e = self.tensors[t.0];
                    batches.insert(e.batch);
                    input_buffers.insert(e.buffer);
                }
                None => missing.push(format!("input {} '{}'", i, spec.name)),
            }
        }
        for (i, spec) in g.desc.outputs.iter().enumerate() {
            match g.active_outputs[i] {
                Some(t) => {
                    let e = self.tensors[t.0];
                    batches.insert(e.batch);
                    if input_buffers.contains(&e.buffer) || !output_buffers.insert(e.buffer) {
                        overlapping.push(format!("output {} '{}'", i, spec.name));
                    }
                }
                None => missing.push(format!("output {} '{}'", i, spec.name)),
            }
        }

        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("slots without an active tensor: {}", missing.join(", ")));
        }
        if batches.len() > 1 {
            let sizes: Vec<String> = batches.iter().map(|b| b.to_string()).collect();
            problems.push(format!("inconsistent batch sizes: [{}]", sizes.join(", ")));
        }
        if !overlapping.is_empty() {
            problems.push(format!(
                "outputs sharing a buffer with another slot: {}",
                overlapping.join(", ")
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DiffusionError::runtime(
                "verify",
                format!("graph '{}' is not executable: {}", g.name(), problems.join("; ")),
            ))
        }
    }

    /// Copy `tensor`'s contents into `out`, converting to `T`.
    pub fn read<T: HostElement>(&self, tensor: TensorId, out: &mut [T]) -> Result<(), DiffusionError> {
        let entry = self.entry(tensor, "read")?;
        let count = self.count(&entry, "read")?;
        let dtype = self.spec(entry.graph, entry.slot, "read")?.dtype;
        if out.len() != count {
            return Err(DiffusionError::invalid_argument(
                "read",
                format!("destination holds {} elements, tensor holds {}", out.len(), count),
            ));
        }
        read_elements(self.buffers[entry.buffer.0].as_bytes(), dtype, out);
        Ok(())
    }

    /// Copy `src` into `tensor`, scaling every value by `scale` and adding it
    /// to the existing contents when `accumulate` is set.
    pub fn write<T: HostElement>(
        &mut self,
        tensor: TensorId,
        src: &[T],
        scale: f32,
        accumulate: bool,
    ) -> Result<(), DiffusionError> {
        let entry = self.entry(tensor, "write")?;
        let count = self.count(&entry, "write")?;
        let dtype = self.spec(entry.graph, entry.slot, "write")?.dtype;
        if src.len() != count {
            return Err(DiffusionError::invalid_argument(
                "write",
                format!("source holds {} elements, tensor holds {}", src.len(), count),
            ));
        }
        write_elements(self.buffers[entry.buffer.0].as_bytes_mut(), dtype, src, scale, accumulate);
        Ok(())
    }

    /// Execute `graph` on the backend with its currently active tensors.
    ///
    /// The graph is verified first whenever its bindings changed since the
    /// last successful verification.
    pub fn execute(&mut self, graph: GraphId) -> Result<(), DiffusionError> {
        let verified = self
            .graphs
            .get(graph.0)
            .map(|g| g.verified)
            .ok_or_else(|| DiffusionError::invalid_argument("execute", format!("unknown graph {:?}", graph)))?;
        if !verified {
            self.verify(graph)?;
            self.graphs[graph.0].verified = true;
        }

        let g = &self.graphs[graph.0];
        let mut input_ids = Vec::with_capacity(g.num_inputs());
        for (i, active) in g.active_inputs.iter().enumerate() {
            let tensor = active.ok_or_else(|| {
                DiffusionError::internal("execute", format!("input {} has no active tensor", i))
            })?;
            let e = self.entry(tensor, "execute")?;
            input_ids.push((e.buffer, self.byte_size(graph, Slot::Input(i), e.batch, "execute")?));
        }
        let mut output_ids = Vec::with_capacity(g.num_outputs());
        for (i, active) in g.active_outputs.iter().enumerate() {
            let tensor = active.ok_or_else(|| {
                DiffusionError::internal("execute", format!("output {} has no active tensor", i))
            })?;
            let e = self.entry(tensor, "execute")?;
            output_ids.push((e.buffer, self.byte_size(graph, Slot::Output(i), e.batch, "execute")?));
        }

        // Output buffers are moved out of the arena for the call so inputs can
        // be borrowed alongside them; verification guarantees they are disjoint.
        let mut taken: Vec<DeviceBuffer> = output_ids
            .iter()
            .map(|(b, _)| std::mem::replace(&mut self.buffers[b.0], DeviceBuffer::empty()))
            .collect();

        let result = {
            let inputs: Vec<&[u8]> = input_ids
                .iter()
                .map(|(b, n)| &self.buffers[b.0].as_bytes()[..*n])
                .collect();
            let mut outputs: Vec<&mut [u8]> = taken
                .iter_mut()
                .zip(&output_ids)
                .map(|(buf, (_, n))| &mut buf.as_bytes_mut()[..*n])
                .collect();
            trace!(graph = %self.graphs[graph.0].name(), "Executing graph");
            self.backend
                .execute(&self.graphs[graph.0].desc, &inputs, &mut outputs)
        };

        for ((b, _), buf) in output_ids.iter().zip(taken) {
            self.buffers[b.0] = buf;
        }
        result
    }
}
