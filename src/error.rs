use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsupported operator: no reverse mapping for layer '{layer}' ({class_name}) at reverse node {node_id}")]
    UnsupportedOperator {
        layer: String,
        class_name: String,
        node_id: usize,
    },

    #[error("Graph integrity error: {0}")]
    GraphIntegrity(String),

    #[error("Layer '{0}' is already instrumented")]
    ReentrantInstrumentation(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
