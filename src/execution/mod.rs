pub mod engine;

pub use engine::{ExecutionEngine, TensorValues};
