use std::collections::{HashMap, HashSet};
use std::mem;

use log::trace;

use super::options::{check_ranges, BottleneckProjection};
use crate::error::{Error, Result};
use crate::model::TensorId;
use crate::ops::tensor::{clip_value, project_value, sum_values};
use crate::ops::Value;

/// Where the first contribution to a reversed tensor came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContributionSource {
    /// Seeded from a model output
    Head,
    /// Returned by the mapping of a reverse node
    Node(usize),
}

#[derive(Debug, Clone)]
enum Contributions {
    Single(Value),
    Many(Vec<Value>),
}

impl Contributions {
    fn push(&mut self, value: Value) {
        let current = mem::replace(self, Contributions::Many(Vec::new()));
        *self = match current {
            Contributions::Single(first) => Contributions::Many(vec![first, value]),
            Contributions::Many(mut values) => {
                values.push(value);
                Contributions::Many(values)
            }
        };
    }

    fn as_slice(&self) -> &[Value] {
        match self {
            Contributions::Single(value) => std::slice::from_ref(value),
            Contributions::Many(values) => values,
        }
    }
}

/// Aggregation state of one reversed tensor
#[derive(Debug, Clone)]
pub struct ReversedTensorEntry {
    source: ContributionSource,
    position: usize,
    contributions: Contributions,
    final_value: Option<Value>,
}

impl ReversedTensorEntry {
    pub fn source(&self) -> ContributionSource {
        self.source
    }

    /// Input position at the node that made the first contribution
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn contributions(&self) -> &[Value] {
        self.contributions.as_slice()
    }

    pub fn final_value(&self) -> Option<&Value> {
        self.final_value.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.final_value.is_some()
    }
}

/// Post-processing applied when a reversed tensor is finalized
#[derive(Debug, Clone, Default)]
pub struct PostProcessing {
    pub bottlenecks: HashSet<TensorId>,
    pub projection: BottleneckProjection,
    pub clip_range: Option<(f32, f32)>,
}

/// Reversed values collected during one reverse walk.
///
/// Entries are created by the first contribution and finalized the first
/// time they are read; a finalized entry accepts no more contributions.
#[derive(Debug, Clone, Default)]
pub struct ReversedTensors {
    entries: HashMap<TensorId, ReversedTensorEntry>,
    post: PostProcessing,
}

impl ReversedTensors {
    /// Create an empty table, rejecting inverted or non-finite ranges
    pub fn new(post: PostProcessing) -> Result<Self> {
        check_ranges(post.clip_range, post.projection)?;
        Ok(Self {
            entries: HashMap::new(),
            post,
        })
    }

    /// Register one contribution per tensor
    pub fn add_contributions(
        &mut self,
        source: ContributionSource,
        tensors: &[TensorId],
        values: Vec<Value>,
    ) -> Result<()> {
        if tensors.len() != values.len() {
            return Err(Error::GraphIntegrity(format!(
                "{} reversed values for {} tensors ({:?})",
                values.len(),
                tensors.len(),
                source
            )));
        }

        for (position, (&tensor, value)) in tensors.iter().zip(values).enumerate() {
            match self.entries.get_mut(&tensor) {
                Some(entry) => {
                    if entry.is_finalized() {
                        return Err(Error::GraphIntegrity(format!(
                            "Reversed tensor {} is already finalized",
                            tensor
                        )));
                    }
                    entry.contributions.push(value);
                    trace!(
                        "Tensor {} now has {} contributions",
                        tensor,
                        entry.contributions().len()
                    );
                }
                None => {
                    trace!("First contribution to tensor {} from {:?}", tensor, source);
                    self.entries.insert(
                        tensor,
                        ReversedTensorEntry {
                            source,
                            position,
                            contributions: Contributions::Single(value),
                            final_value: None,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    pub fn contains(&self, tensor: TensorId) -> bool {
        self.entries.contains_key(&tensor)
    }

    /// Aggregate, post-process and cache the reversed value of a tensor
    pub fn get_final(&mut self, tensor: TensorId) -> Result<Value> {
        let post = &self.post;
        let entry = self.entries.get_mut(&tensor).ok_or_else(|| {
            Error::GraphIntegrity(format!("Tensor {} has no reversed value", tensor))
        })?;

        if let Some(value) = &entry.final_value {
            return Ok(value.clone());
        }

        let mut value = match &entry.contributions {
            Contributions::Single(value) => value.clone(),
            Contributions::Many(values) => sum_values(values)?,
        };
        if post.projection.is_enabled() && post.bottlenecks.contains(&tensor) {
            value = project_value(&value, post.projection.output_range());
        }
        if let Some((lo, hi)) = post.clip_range {
            value = clip_value(&value, lo, hi);
        }

        entry.final_value = Some(value.clone());
        Ok(value)
    }

    pub fn entry(&self, tensor: TensorId) -> Option<&ReversedTensorEntry> {
        self.entries.get(&tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &ReversedTensorEntry)> {
        self.entries.iter()
    }
}
