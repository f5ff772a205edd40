use crate::error::{Error, Result};
use crate::graph::tracer::TraceOptions;

/// How reversed values of bottleneck tensors are rescaled
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum BottleneckProjection {
    /// Bottleneck values are left as aggregated
    #[default]
    Disabled,
    /// Project into `[-1, 1]`
    DefaultRange,
    /// Project into `[a, b]`
    Range(f32, f32),
}

impl BottleneckProjection {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, BottleneckProjection::Disabled)
    }

    /// Explicit output range, `None` for the default range or when disabled
    pub fn output_range(&self) -> Option<(f32, f32)> {
        match *self {
            BottleneckProjection::Range(a, b) => Some((a, b)),
            _ => None,
        }
    }
}

/// Options for a reverse propagation run
#[derive(Debug, Clone, Default)]
pub struct ReverseOptions {
    /// Clamp every finalized reversed value into this range
    pub clip_range: Option<(f32, f32)>,
    /// Projection applied to reversed bottleneck tensors
    pub bottleneck_projection: BottleneckProjection,
    /// Keep the whole reversed-tensor table in the result
    pub return_all_reversed_tensors: bool,
    /// Options for tracing the model before the reverse walk
    pub trace: TraceOptions,
}

impl ReverseOptions {
    /// Create a new reverse options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the clip range
    pub fn set_clip_range(mut self, lo: f32, hi: f32) -> Self {
        self.clip_range = Some((lo, hi));
        self
    }

    /// Set the bottleneck projection
    pub fn set_bottleneck_projection(mut self, projection: BottleneckProjection) -> Self {
        self.bottleneck_projection = projection;
        self
    }

    /// Return every reversed tensor, not only the reversed inputs
    pub fn return_all_reversed_tensors(mut self, enable: bool) -> Self {
        self.return_all_reversed_tensors = enable;
        self
    }

    /// Set the trace options
    pub fn set_trace_options(mut self, trace: TraceOptions) -> Self {
        self.trace = trace;
        self
    }

    /// Reject ranges that are inverted or not finite
    pub fn validate(&self) -> Result<()> {
        check_ranges(self.clip_range, self.bottleneck_projection)
    }
}

pub(crate) fn check_ranges(clip_range: Option<(f32, f32)>, projection: BottleneckProjection) -> Result<()> {
    if let Some((lo, hi)) = clip_range {
        check_range("clip range", lo, hi)?;
    }
    if let BottleneckProjection::Range(a, b) = projection {
        check_range("bottleneck projection range", a, b)?;
    }
    Ok(())
}

fn check_range(what: &str, lo: f32, hi: f32) -> Result<()> {
    if !lo.is_finite() || !hi.is_finite() || lo > hi {
        return Err(Error::InvalidConfig(format!(
            "Invalid {}: [{}, {}]",
            what, lo, hi
        )));
    }
    Ok(())
}
