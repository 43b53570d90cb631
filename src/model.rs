//! The inference side of the service: a trait seam over "tensor in,
//! probabilities out", the TensorFlow-backed implementation, and top-k
//! formatting of the raw probability vector.

use serde::Serialize;
use tensorflow::{Graph, Operation, Session, SessionRunArgs, Tensor};
use thiserror::Error;

use crate::classes::{self, CLASS_NAMES};
use crate::preprocess::ImageTensor;

pub const NUM_CLASSES: usize = CLASS_NAMES.len();
pub const TOP_K: usize = 5;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("tensorflow error: {0}")]
    Tensorflow(#[from] tensorflow::Status),
    #[error("none of the candidate operations [{0}] exist in the graph")]
    MissingOperation(String),
    #[error("model produced {got} scores, expected {expected}")]
    UnexpectedOutput { got: usize, expected: usize },
}

/// Anything that can score an input tensor against the 36-class registry.
/// The production implementation is [`Model`]; tests substitute fixed-output
/// mocks.
pub trait Classifier: Send + Sync {
    /// Returns one probability per registry class, index-aligned.
    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError>;
}

/// A loaded TensorFlow graph with its serving session and resolved
/// input/output tensors. Immutable after construction; `Session` is safe to
/// share across request handlers.
#[derive(Debug)]
pub struct Model {
    session: Session,
    input: Operation,
    input_index: i32,
    output: Operation,
    output_index: i32,
}

impl Model {
    pub fn new(
        session: Session,
        input: Operation,
        input_index: i32,
        output: Operation,
        output_index: i32,
    ) -> Self {
        Model {
            session,
            input,
            input_index,
            output,
            output_index,
        }
    }
}

impl Classifier for Model {
    fn infer(&self, input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
        let mut tensor = Tensor::<f32>::new(&input.shape());
        tensor.copy_from_slice(input.data());

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.input, self.input_index, &tensor);
        let fetch = args.request_fetch(&self.output, self.output_index);
        self.session.run(&mut args)?;

        let output: Tensor<f32> = args.fetch(fetch)?;
        let probabilities = output.to_vec();
        if probabilities.len() != NUM_CLASSES {
            return Err(ModelError::UnexpectedOutput {
                got: probabilities.len(),
                expected: NUM_CLASSES,
            });
        }
        Ok(probabilities)
    }
}

/// One formatted entry of a prediction response.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: &'static str,
    pub confidence: String,
    pub probability: f32,
}

/// Picks the `k` highest-probability classes, descending. The sort is stable,
/// so equal probabilities keep their registry order.
pub fn top_k(probabilities: &[f32], k: usize) -> Vec<Prediction> {
    let mut indices: Vec<usize> = (0..probabilities.len()).collect();
    indices.sort_by(|&a, &b| {
        probabilities[b]
            .partial_cmp(&probabilities[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    indices
        .into_iter()
        .take(k)
        .map(|i| {
            let probability = probabilities[i];
            Prediction {
                class: classes::class_at(i),
                confidence: format!("{:.2}%", probability * 100.0),
                probability: (probability * 10_000.0).round() / 10_000.0,
            }
        })
        .collect()
}

/// Index of the highest probability, first index winning ties.
pub fn argmax(probabilities: &[f32]) -> usize {
    probabilities
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| {
            if p > best.1 {
                (i, p)
            } else {
                best
            }
        })
        .0
}

/// Resolves the first operation in `candidates` that exists in the graph.
/// Models exported from different toolchains name their input and output
/// tensors differently, so loading tries a known-compatible list.
pub fn resolve_operation(graph: &Graph, candidates: &[&str]) -> Result<Operation, ModelError> {
    for name in candidates {
        if let Ok(Some(op)) = graph.operation_by_name(name) {
            return Ok(op);
        }
    }
    Err(ModelError::MissingOperation(candidates.join(", ")))
}
