//! Host reference backend.
//!
//! Runs stages on the CPU using a handful of deterministic reference kernels.
//! A stage file is a JSON manifest: either a single graph object or
//! `{"graphs": [...]}`. Each graph declares its slots and one kernel:
//!
//! ```json
//! {
//!   "name": "unet_head",
//!   "inputs":  [{ "name": "latent", "shape": [1, 4, 64, 64], "dtype": "float32" }],
//!   "outputs": [{ "name": "noise",  "shape": [1, 4, 64, 64], "dtype": "float32" }],
//!   "kernel": { "type": "affine", "weights": [0.1], "bias": 0.0, "activation": "tanh" }
//! }
//! ```
//!
//! Inputs are read cyclically: element `i` of an output reads element
//! `i % len` of each input. This is enough to exercise slot wiring, guidance
//! blending and decoding without a neural-network runtime.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, trace};

use crate::error::DiffusionError;
use crate::graph::{GraphDesc, SlotSpec};
use crate::tensor::{read_elements, write_elements};

use super::{GraphBackend, PerformanceMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Tanh,
}

impl Activation {
    fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Tanh => x.tanh(),
        }
    }
}

/// Reference kernel executed by the host backend.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostKernel {
    /// Output `j` copies input `j % num_inputs`.
    #[default]
    Identity,
    /// `y[i] = act(sum_k weights[k] * input_k[i] + bias)` for every output.
    Affine {
        weights: Vec<f32>,
        #[serde(default)]
        bias: f32,
        #[serde(default)]
        activation: Activation,
    },
}

#[derive(Debug, Deserialize)]
struct GraphManifest {
    name: String,
    inputs: Vec<SlotSpec>,
    outputs: Vec<SlotSpec>,
    #[serde(default)]
    kernel: HostKernel,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Manifest {
    Many { graphs: Vec<GraphManifest> },
    One(GraphManifest),
}

/// Native handle stored inside each [`GraphDesc`] produced by this backend.
#[derive(Debug, Clone)]
pub struct HostGraph {
    pub kernel: HostKernel,
}

fn build(manifest: GraphManifest) -> Result<GraphDesc, DiffusionError> {
    if manifest.outputs.is_empty() {
        return Err(DiffusionError::invalid_argument(
            "load",
            format!("graph '{}' declares no outputs", manifest.name),
        ));
    }
    match &manifest.kernel {
        HostKernel::Identity if manifest.inputs.is_empty() => {
            return Err(DiffusionError::invalid_argument(
                "load",
                format!("identity graph '{}' declares no inputs", manifest.name),
            ));
        }
        HostKernel::Affine { weights, .. } if weights.len() != manifest.inputs.len() => {
            return Err(DiffusionError::invalid_argument(
                "load",
                format!(
                    "affine graph '{}' has {} weights for {} inputs",
                    manifest.name,
                    weights.len(),
                    manifest.inputs.len()
                ),
            ));
        }
        _ => {}
    }
    let native = HostGraph {
        kernel: manifest.kernel,
    };
    Ok(GraphDesc::new(
        manifest.name,
        manifest.inputs,
        manifest.outputs,
        Box::new(native),
    ))
}

/// CPU backend running [`HostKernel`]s.
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        debug!("Initialized HostBackend");
        Self
    }

    /// Parse a manifest string into its graphs.
    pub fn graphs_from_json(json: &str) -> Result<Vec<GraphDesc>, DiffusionError> {
        let graphs = match serde_json::from_str::<Manifest>(json)? {
            Manifest::Many { graphs } => graphs,
            Manifest::One(graph) => vec![graph],
        };
        graphs.into_iter().map(build).collect()
    }

    /// Parse a manifest holding exactly one graph.
    pub fn graph_from_json(json: &str) -> Result<GraphDesc, DiffusionError> {
        let mut graphs = Self::graphs_from_json(json)?;
        if graphs.len() != 1 {
            return Err(DiffusionError::invalid_argument(
                "load",
                format!("expected one graph, manifest holds {}", graphs.len()),
            ));
        }
        Ok(graphs.remove(0))
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn load(&self, path: &Path) -> Result<Vec<GraphDesc>, DiffusionError> {
        let json = fs::read_to_string(path).map_err(|e| {
            DiffusionError::runtime("load", format!("could not read {}: {}", path.display(), e))
        })?;
        let graphs = Self::graphs_from_json(&json)?;
        info!(path = %path.display(), graphs = graphs.len(), "Loaded host manifest");
        Ok(graphs)
    }

    fn execute(
        &self,
        graph: &GraphDesc,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), DiffusionError> {
        let native = graph.native::<HostGraph>().ok_or_else(|| {
            DiffusionError::runtime(
                "execute",
                format!("graph '{}' was not loaded by the host backend", graph.name),
            )
        })?;
        if inputs.len() != graph.inputs.len() || outputs.len() != graph.outputs.len() {
            return Err(DiffusionError::runtime(
                "execute",
                format!(
                    "graph '{}' expects {} inputs and {} outputs, got {} and {}",
                    graph.name,
                    graph.inputs.len(),
                    graph.outputs.len(),
                    inputs.len(),
                    outputs.len()
                ),
            ));
        }

        let mut values: Vec<Vec<f32>> = Vec::with_capacity(inputs.len());
        for (bytes, spec) in inputs.iter().zip(&graph.inputs) {
            let mut v = vec![0.0f32; bytes.len() / spec.dtype.size()];
            read_elements(bytes, spec.dtype, &mut v);
            if v.is_empty() {
                return Err(DiffusionError::runtime(
                    "execute",
                    format!("input '{}' of graph '{}' is empty", spec.name, graph.name),
                ));
            }
            values.push(v);
        }

        for (j, (out, spec)) in outputs.iter_mut().zip(&graph.outputs).enumerate() {
            let n = out.len() / spec.dtype.size();
            let result: Vec<f32> = match &native.kernel {
                HostKernel::Identity => {
                    let src = &values[j % values.len()];
                    (0..n).map(|i| src[i % src.len()]).collect()
                }
                HostKernel::Affine {
                    weights,
                    bias,
                    activation,
                } => (0..n)
                    .map(|i| {
                        let sum: f32 = weights
                            .iter()
                            .zip(&values)
                            .map(|(w, v)| w * v[i % v.len()])
                            .sum();
                        activation.apply(sum + bias)
                    })
                    .collect(),
            };
            write_elements(out, spec.dtype, &result, 1.0, false);
        }
        trace!(graph = %graph.name, "Host execute complete");
        Ok(())
    }

    fn set_performance_mode(&self, mode: PerformanceMode) {
        // Host kernels run at a single clock; the hint is only logged.
        debug!(?mode, "Performance mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tensor::{DeviceBuffer, ElementType};
    use std::io::Write;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f32_values(bytes: &[u8]) -> Vec<f32> {
        let mut out = vec![0.0f32; bytes.len() / 4];
        read_elements(bytes, ElementType::Float32, &mut out);
        out
    }

    #[test]
    fn test_load_single_graph_manifest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "decoder",
                "inputs": [{{ "name": "latent", "shape": [1, 4, 2, 2], "dtype": "float32" }}],
                "outputs": [{{ "name": "image", "shape": [1, 2, 2, 3], "dtype": "float32" }}]
            }}"#
        )
        .unwrap();

        let backend = HostBackend::new();
        let graphs = backend.load(file.path()).unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].name, "decoder");
        assert_eq!(graphs[0].outputs[0].element_count(), Some(12));
        assert_eq!(graphs[0].native::<HostGraph>().unwrap().kernel, HostKernel::Identity);
    }

    #[test]
    fn test_load_multi_graph_manifest() {
        let graphs = HostBackend::graphs_from_json(
            r#"{ "graphs": [
                { "name": "a", "inputs": [{ "name": "x", "shape": [1, 1], "dtype": "float32" }],
                  "outputs": [{ "name": "y", "shape": [1, 1], "dtype": "float32" }] },
                { "name": "b", "inputs": [{ "name": "x", "shape": [1, 1], "dtype": "float32" }],
                  "outputs": [{ "name": "y", "shape": [1, 1], "dtype": "float32" }] }
            ] }"#,
        )
        .unwrap();
        let names: Vec<&str> = graphs.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_load_missing_file_is_runtime_error() {
        let backend = HostBackend::new();
        let err = backend.load(Path::new("/nonexistent/stage.bin")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RuntimeError);
    }

    #[test]
    fn test_affine_weight_count_checked() {
        let err = HostBackend::graph_from_json(
            r#"{ "name": "bad",
                 "inputs": [{ "name": "x", "shape": [1, 1], "dtype": "float32" }],
                 "outputs": [{ "name": "y", "shape": [1, 1], "dtype": "float32" }],
                 "kernel": { "type": "affine", "weights": [1.0, 2.0] } }"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_affine_with_tanh() {
        let graph = HostBackend::graph_from_json(
            r#"{ "name": "t",
                 "inputs": [
                    { "name": "a", "shape": [1, 2], "dtype": "float32" },
                    { "name": "b", "shape": [1, 1], "dtype": "float32" }
                 ],
                 "outputs": [{ "name": "y", "shape": [1, 2], "dtype": "float32" }],
                 "kernel": { "type": "affine", "weights": [2.0, -1.0], "bias": 0.5, "activation": "tanh" } }"#,
        )
        .unwrap();
        let a = f32_bytes(&[1.0, 0.0]);
        let b = f32_bytes(&[0.5]);
        let mut y = DeviceBuffer::zeroed(8).unwrap();
        HostBackend::new()
            .execute(&graph, &[a.as_slice(), b.as_slice()], &mut [y.as_bytes_mut()])
            .unwrap();

        let out = f32_values(y.as_bytes());
        assert!((out[0] - 2.0f32.tanh()).abs() < 1e-6);
        assert!(out[1].abs() < 1e-6);
    }

    #[test]
    fn test_identity_converts_element_types() {
        let graph = HostBackend::graph_from_json(
            r#"{ "name": "echo",
                 "inputs": [{ "name": "tokens", "shape": [1, 3], "dtype": "int32" }],
                 "outputs": [{ "name": "ids", "shape": [1, 3], "dtype": "float32" }] }"#,
        )
        .unwrap();
        let mut tokens = vec![0u8; 12];
        write_elements(&mut tokens, ElementType::Int32, &[49406i32, 320, 49407], 1.0, false);
        let mut out = vec![0u8; 12];
        HostBackend::new()
            .execute(&graph, &[tokens.as_slice()], &mut [out.as_mut_slice()])
            .unwrap();
        assert_eq!(f32_values(&out), [49406.0, 320.0, 49407.0]);
    }

    #[test]
    fn test_execute_rejects_slot_count_mismatch() {
        let graph = HostBackend::graph_from_json(
            r#"{ "name": "echo",
                 "inputs": [{ "name": "x", "shape": [1, 1], "dtype": "float32" }],
                 "outputs": [{ "name": "y", "shape": [1, 1], "dtype": "float32" }] }"#,
        )
        .unwrap();
        let err = HostBackend::new().execute(&graph, &[], &mut []).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RuntimeError);
    }

    #[test]
    fn test_performance_mode_is_accepted() {
        let backend = HostBackend::new();
        backend.set_performance_mode(PerformanceMode::Burst);
        backend.set_performance_mode(PerformanceMode::Normal);
        assert_eq!(backend.name(), "host");
    }
}
