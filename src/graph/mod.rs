pub mod bottleneck;
pub mod execution_graph;
pub mod instrument;
pub mod tracer;

pub use bottleneck::get_bottleneck_tensors;
pub use execution_graph::{build_execution_graph, ExecutionGraph, ExecutionGraphBuilder, GraphNode, NodeId, NodeSummary};
pub use instrument::{with_instrumentation, CallLog, Instrumentation, RecordedCall};
pub use tracer::{
    get_model_layers, model_contains, model_contains_all, prune_unreachable, trace_model_execution,
    ExecutionStep, ModelTrace, TraceOptions,
};
