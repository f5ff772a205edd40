pub mod error;
pub mod model;
pub mod ops;
pub mod graph;
pub mod reverse;
pub mod execution;

// Re-export commonly used types
pub use error::{Error, Result};
pub use model::{copy_layer, get_kernel, GraphBuilder, Layer, LayerId, LayerKind, LayerRef, Model, TensorId};
pub use ops::{Operator, Value};
pub use graph::{
    build_execution_graph, get_bottleneck_tensors, trace_model_execution, ExecutionGraph, ExecutionGraphBuilder,
    ExecutionStep, ModelTrace, TraceOptions,
};
pub use reverse::{
    reverse_model, BottleneckProjection, ReverseContext, ReverseEngine, ReverseHandler, ReverseMapping,
    ReverseMappingRegistry, ReverseOptions, ReverseResult, ReversedTensors,
};
pub use execution::{ExecutionEngine, TensorValues};
