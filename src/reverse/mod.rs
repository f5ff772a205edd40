pub mod engine;
pub mod options;
pub mod registry;
pub mod tensors;

pub use engine::{reverse_model, HeadMapping, ReverseEngine, ReverseResult};
pub use options::{BottleneckProjection, ReverseOptions};
pub use registry::{
    MappingFactory, ModelContext, ReverseContext, ReverseFn, ReverseHandler, ReverseMapping,
    ReverseMappingRegistry,
};
pub use tensors::{ContributionSource, PostProcessing, ReversedTensorEntry, ReversedTensors};
