//! Three-stage model loading with ordered fallback.
//!
//! Strategies are tried in order of decreasing fidelity, first success wins:
//! a full SavedModel bundle, a frozen GraphDef, and finally rebuilding the
//! known architecture (MobileNetV2 backbone plus a small dense head) and
//! loading only the head weights. A missing or corrupt weights file in the
//! last stage degrades to random initialization instead of failing.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use tensorflow::{
    DataType, Graph, ImportGraphDefOptions, Operation, Output, SavedModelBundle, Session,
    SessionOptions, Status, Tensor, DEFAULT_SERVING_SIGNATURE_DEF_KEY,
};
use thiserror::Error;

use crate::model::{self, Model, ModelError, NUM_CLASSES};

/// Input-tensor names seen across export toolchains. Models exported with a
/// custom input layer keep its name, so resolution walks this list instead of
/// assuming one convention.
const INPUT_OP_CANDIDATES: &[&str] = &["serving_default_input_1", "input_1", "x", "input"];
const OUTPUT_OP_CANDIDATES: &[&str] = &[
    "StatefulPartitionedCall",
    "Identity",
    "predictions/Softmax",
    "output",
];
const FEATURE_OP_CANDIDATES: &[&str] = &[
    "global_average_pooling2d/Mean",
    "MobilenetV2/Logits/AvgPool",
    "feature_vector",
];

/// Width of the pooled MobileNetV2 feature vector.
const FEATURE_DIM: u64 = 1280;
/// Width of the two hidden dense layers in the rebuilt head.
const HIDDEN_DIM: u64 = 128;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("tensorflow error: {0}")]
    Tensorflow(#[from] Status),
    #[error("{0}")]
    Model(#[from] ModelError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("serving signature declares no {0}")]
    EmptySignature(&'static str),
    #[error("head weights file {path} holds {got} floats, expected {expected}")]
    WeightShape {
        path: String,
        got: usize,
        expected: usize,
    },
}

/// All strategies exhausted; keeps each stage's error for the shutdown log.
#[derive(Debug)]
pub struct LoadFailure {
    failures: Vec<(LoadStrategy, LoadError)>,
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all model loading strategies failed")?;
        for (strategy, error) in &self.failures {
            write!(f, "; {strategy}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LoadFailure {}

/// Filesystem layout of the model artifacts under the configured directory.
pub struct ModelPaths {
    saved_model: PathBuf,
    frozen_graph: PathBuf,
    backbone: PathBuf,
    head_weights: PathBuf,
}

impl ModelPaths {
    pub fn new(model_dir: &Path) -> Self {
        ModelPaths {
            saved_model: model_dir.join("saved_model"),
            frozen_graph: model_dir.join("frozen_graph.pb"),
            backbone: model_dir.join("backbone.pb"),
            head_weights: model_dir.join("head_weights.bin"),
        }
    }

    pub fn frozen_graph(&self) -> &Path {
        &self.frozen_graph
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStrategy {
    SavedModel,
    FrozenGraph,
    RebuildArchitecture,
}

impl LoadStrategy {
    pub const ALL: [LoadStrategy; 3] = [
        LoadStrategy::SavedModel,
        LoadStrategy::FrozenGraph,
        LoadStrategy::RebuildArchitecture,
    ];

    fn attempt(self, paths: &ModelPaths) -> Result<Model, LoadError> {
        match self {
            LoadStrategy::SavedModel => load_saved_model(&paths.saved_model),
            LoadStrategy::FrozenGraph => load_frozen_graph(&paths.frozen_graph),
            LoadStrategy::RebuildArchitecture => {
                rebuild_architecture(&paths.backbone, &paths.head_weights)
            }
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStrategy::SavedModel => "saved-model bundle",
            LoadStrategy::FrozenGraph => "frozen graph",
            LoadStrategy::RebuildArchitecture => "rebuilt architecture",
        };
        f.write_str(name)
    }
}

/// Tries every strategy in order and returns the first model produced.
pub fn load_model(paths: &ModelPaths) -> Result<Model, LoadFailure> {
    let mut failures = Vec::new();
    for strategy in LoadStrategy::ALL {
        info!("loading model via {strategy}...");
        match strategy.attempt(paths) {
            Ok(loaded) => {
                info!("model loaded via {strategy}");
                return Ok(loaded);
            }
            Err(error) => {
                warn!("{strategy} loading failed: {error}");
                failures.push((strategy, error));
            }
        }
    }
    Err(LoadFailure { failures })
}

/// Strategy 1: full SavedModel bundle, input/output resolved through the
/// serving signature, with a fallback to conventional op names when the
/// signature is absent or points at ops the graph does not contain.
fn load_saved_model(dir: &Path) -> Result<Model, LoadError> {
    let mut graph = Graph::new();
    let bundle = SavedModelBundle::load(&SessionOptions::new(), &["serve"], &mut graph, dir)?;

    let (input, input_index, output, output_index) = match serving_signature(&bundle, &graph) {
        Ok(resolved) => resolved,
        Err(error) => {
            warn!("serving signature unusable ({error}); resolving conventional op names");
            let input = model::resolve_operation(&graph, INPUT_OP_CANDIDATES)?;
            let output = model::resolve_operation(&graph, OUTPUT_OP_CANDIDATES)?;
            (input, 0, output, 0)
        }
    };

    Ok(Model::new(
        bundle.session,
        input,
        input_index,
        output,
        output_index,
    ))
}

fn serving_signature(
    bundle: &SavedModelBundle,
    graph: &Graph,
) -> Result<(Operation, i32, Operation, i32), LoadError> {
    let signature = bundle
        .meta_graph_def()
        .get_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY)?;
    let input_info = signature
        .inputs()
        .values()
        .next()
        .ok_or(LoadError::EmptySignature("inputs"))?;
    let output_info = signature
        .outputs()
        .values()
        .next()
        .ok_or(LoadError::EmptySignature("outputs"))?;

    let input = graph.operation_by_name_required(&input_info.name().name)?;
    let output = graph.operation_by_name_required(&output_info.name().name)?;
    Ok((
        input,
        input_info.name().index,
        output,
        output_info.name().index,
    ))
}

/// Strategy 2: architecture and weights as a frozen GraphDef. There is no
/// training state to restore, so the graph serves as-is once the input and
/// output ops are found.
fn load_frozen_graph(path: &Path) -> Result<Model, LoadError> {
    let bytes = read_file(path)?;
    let mut graph = Graph::new();
    graph.import_graph_def(&bytes, &ImportGraphDefOptions::new())?;

    let input = model::resolve_operation(&graph, INPUT_OP_CANDIDATES)?;
    let output = model::resolve_operation(&graph, OUTPUT_OP_CANDIDATES)?;
    let session = Session::new(&SessionOptions::new(), &graph)?;
    Ok(Model::new(session, input, 0, output, 0))
}

/// Strategy 3: import the pretrained backbone and rebuild the classification
/// head in-graph: Dense(128, relu) x2 into Dense(36, softmax). Head weights
/// come from a sidecar file; when that fails the head starts from random
/// initialization, which still serves (degenerate) predictions.
fn rebuild_architecture(backbone: &Path, weights: &Path) -> Result<Model, LoadError> {
    let bytes = read_file(backbone)?;
    let mut graph = Graph::new();
    graph.import_graph_def(&bytes, &ImportGraphDefOptions::new())?;

    let input = model::resolve_operation(&graph, INPUT_OP_CANDIDATES)?;
    let features = model::resolve_operation(&graph, FEATURE_OP_CANDIDATES)?;

    let head = match read_head_weights(weights) {
        Ok(head) => head,
        Err(error) => {
            warn!("could not load head weights ({error}); using random initialization");
            HeadWeights::random()
        }
    };

    let output = append_classifier_head(&mut graph, features, &head)?;
    let session = Session::new(&SessionOptions::new(), &graph)?;
    Ok(Model::new(session, input, 0, output, 0))
}

/// Weight tensors for the rebuilt head, in forward order.
#[derive(Debug)]
struct HeadWeights {
    w1: Tensor<f32>,
    b1: Tensor<f32>,
    w2: Tensor<f32>,
    b2: Tensor<f32>,
    w3: Tensor<f32>,
    b3: Tensor<f32>,
}

impl HeadWeights {
    const FLOAT_COUNT: usize = (FEATURE_DIM * HIDDEN_DIM
        + HIDDEN_DIM
        + HIDDEN_DIM * HIDDEN_DIM
        + HIDDEN_DIM
        + HIDDEN_DIM * NUM_CLASSES as u64
        + NUM_CLASSES as u64) as usize;

    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut filled = |dims: &[u64]| {
            let len = dims.iter().product::<u64>() as usize;
            let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-0.05..0.05)).collect();
            let mut tensor = Tensor::new(dims);
            tensor.copy_from_slice(&values);
            tensor
        };
        HeadWeights {
            w1: filled(&[FEATURE_DIM, HIDDEN_DIM]),
            b1: filled(&[HIDDEN_DIM]),
            w2: filled(&[HIDDEN_DIM, HIDDEN_DIM]),
            b2: filled(&[HIDDEN_DIM]),
            w3: filled(&[HIDDEN_DIM, NUM_CLASSES as u64]),
            b3: filled(&[NUM_CLASSES as u64]),
        }
    }
}

/// Parses the sidecar weights file: flat little-endian f32, layers
/// concatenated in forward order (w1, b1, w2, b2, w3, b3).
fn read_head_weights(path: &Path) -> Result<HeadWeights, LoadError> {
    let bytes = read_file(path)?;
    let got = bytes.len() / 4;
    if bytes.len() % 4 != 0 || got != HeadWeights::FLOAT_COUNT {
        return Err(LoadError::WeightShape {
            path: path.display().to_string(),
            got,
            expected: HeadWeights::FLOAT_COUNT,
        });
    }

    let floats: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    let mut offset = 0;
    let mut segment = |dims: &[u64]| {
        let len = dims.iter().product::<u64>() as usize;
        let mut tensor = Tensor::new(dims);
        tensor.copy_from_slice(&floats[offset..offset + len]);
        offset += len;
        tensor
    };

    Ok(HeadWeights {
        w1: segment(&[FEATURE_DIM, HIDDEN_DIM]),
        b1: segment(&[HIDDEN_DIM]),
        w2: segment(&[HIDDEN_DIM, HIDDEN_DIM]),
        b2: segment(&[HIDDEN_DIM]),
        w3: segment(&[HIDDEN_DIM, NUM_CLASSES as u64]),
        b3: segment(&[NUM_CLASSES as u64]),
    })
}

/// Builds the dense head on top of the backbone's pooled feature output and
/// returns the softmax operation.
fn append_classifier_head(
    graph: &mut Graph,
    features: Operation,
    head: &HeadWeights,
) -> Result<Operation, Status> {
    let features = Output {
        operation: features,
        index: 0,
    };
    let h1 = dense_layer(graph, "head_fc1", features, &head.w1, &head.b1, true)?;
    let h2 = dense_layer(graph, "head_fc2", h1, &head.w2, &head.b2, true)?;
    let logits = dense_layer(graph, "head_fc3", h2, &head.w3, &head.b3, false)?;

    let mut softmax = graph.new_operation("Softmax", "head_softmax")?;
    softmax.add_input(logits);
    softmax.finish()
}

fn dense_layer(
    graph: &mut Graph,
    name: &str,
    input: Output,
    weights: &Tensor<f32>,
    bias: &Tensor<f32>,
    relu: bool,
) -> Result<Output, Status> {
    let kernel = constant(graph, &format!("{name}/kernel"), weights)?;
    let bias_const = constant(graph, &format!("{name}/bias"), bias)?;

    let matmul = {
        let mut op = graph.new_operation("MatMul", &format!("{name}/matmul"))?;
        op.add_input(input);
        op.add_input(Output {
            operation: kernel,
            index: 0,
        });
        op.finish()?
    };
    let biased = {
        let mut op = graph.new_operation("BiasAdd", &format!("{name}/bias_add"))?;
        op.add_input(Output {
            operation: matmul,
            index: 0,
        });
        op.add_input(Output {
            operation: bias_const,
            index: 0,
        });
        op.finish()?
    };

    let activated = if relu {
        let mut op = graph.new_operation("Relu", &format!("{name}/relu"))?;
        op.add_input(Output {
            operation: biased,
            index: 0,
        });
        op.finish()?
    } else {
        biased
    };
    Ok(Output {
        operation: activated,
        index: 0,
    })
}

fn constant(graph: &mut Graph, name: &str, value: &Tensor<f32>) -> Result<Operation, Status> {
    let mut op = graph.new_operation("Const", name)?;
    op.set_attr_tensor("value", value.clone())?;
    op.set_attr_type("dtype", DataType::Float)?;
    op.finish()
}

fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })
}
