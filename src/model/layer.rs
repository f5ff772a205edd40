use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LayerId, Model, TensorId};
use crate::error::{Error, Result};
use crate::graph::instrument::CallLog;
use crate::ops::{Operator, Value};

/// Shared handle to a layer
pub type LayerRef = Arc<Layer>;

/// What a layer computes
#[derive(Debug)]
pub enum LayerKind {
    /// Placeholder producing a model input
    Input,
    /// A plain operator
    Operator(Box<dyn Operator>),
    /// A whole model used as a single layer
    Container(Model),
}

/// Inputs and outputs of one recorded application of a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// A reusable unit of computation.
///
/// A layer keeps the history of its applications (inbound nodes) and can
/// carry a call recorder while a model is being traced.
#[derive(Debug)]
pub struct Layer {
    id: LayerId,
    name: String,
    kind: LayerKind,
    inbound_nodes: Mutex<Vec<NodeRecord>>,
    recorder: Mutex<Option<Arc<CallLog>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Layer {
    fn with_kind(name: impl Into<String>, kind: LayerKind) -> LayerRef {
        Arc::new(Self {
            id: LayerId::fresh(),
            name: name.into(),
            kind,
            inbound_nodes: Mutex::new(Vec::new()),
            recorder: Mutex::new(None),
        })
    }

    /// Create an input placeholder layer
    pub fn input(name: impl Into<String>) -> LayerRef {
        Self::with_kind(name, LayerKind::Input)
    }

    /// Create a layer around an operator
    pub fn new(name: impl Into<String>, operator: impl Operator + 'static) -> LayerRef {
        Self::from_operator(name, Box::new(operator))
    }

    pub fn from_operator(name: impl Into<String>, operator: Box<dyn Operator>) -> LayerRef {
        Self::with_kind(name, LayerKind::Operator(operator))
    }

    /// Wrap a model so it can be applied as a single layer
    pub fn container(name: impl Into<String>, model: Model) -> LayerRef {
        Self::with_kind(name, LayerKind::Container(model))
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn class_name(&self) -> &'static str {
        match &self.kind {
            LayerKind::Input => "InputLayer",
            LayerKind::Operator(op) => op.class_name(),
            LayerKind::Container(_) => "Model",
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, LayerKind::Input)
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, LayerKind::Container(_))
    }

    pub fn operator(&self) -> Option<&dyn Operator> {
        match &self.kind {
            LayerKind::Operator(op) => Some(op.as_ref()),
            _ => None,
        }
    }

    pub fn container_model(&self) -> Option<&Model> {
        match &self.kind {
            LayerKind::Container(model) => Some(model),
            _ => None,
        }
    }

    pub fn weights(&self) -> Vec<Value> {
        match &self.kind {
            LayerKind::Operator(op) => op.weights(),
            _ => Vec::new(),
        }
    }

    /// Number of times this layer has been applied
    pub fn inbound_count(&self) -> usize {
        lock(&self.inbound_nodes).len()
    }

    /// Inputs of the application at `node_index`
    pub fn input_at(&self, node_index: usize) -> Result<Vec<TensorId>> {
        self.node_at(node_index).map(|node| node.inputs)
    }

    /// Outputs of the application at `node_index`
    pub fn output_at(&self, node_index: usize) -> Result<Vec<TensorId>> {
        self.node_at(node_index).map(|node| node.outputs)
    }

    fn node_at(&self, node_index: usize) -> Result<NodeRecord> {
        lock(&self.inbound_nodes)
            .get(node_index)
            .cloned()
            .ok_or_else(|| {
                Error::InvalidGraph(format!(
                    "Layer '{}' has no inbound node {}",
                    self.name, node_index
                ))
            })
    }

    /// Apply the layer symbolically.
    ///
    /// Input layers pass their tensor through, operators mint fresh output
    /// handles, and containers replay their inner graph. The application is
    /// appended to the inbound nodes and reported to an installed recorder.
    pub fn call(&self, inputs: &[TensorId]) -> Result<Vec<TensorId>> {
        let outputs = match &self.kind {
            LayerKind::Input => {
                if inputs.len() != 1 {
                    return Err(Error::InvalidGraph(format!(
                        "Input layer '{}' takes exactly one tensor, got {}",
                        self.name,
                        inputs.len()
                    )));
                }
                inputs.to_vec()
            }
            LayerKind::Operator(op) => (0..op.output_count(inputs.len()))
                .map(|_| TensorId::fresh())
                .collect(),
            LayerKind::Container(model) => model.call_symbolic(inputs, false)?,
        };

        lock(&self.inbound_nodes).push(NodeRecord {
            inputs: inputs.to_vec(),
            outputs: outputs.clone(),
        });

        let recorder = lock(&self.recorder).clone();
        if let Some(log) = recorder {
            log.record(self.id, inputs, &outputs);
        }

        Ok(outputs)
    }

    /// Evaluate the layer numerically
    pub fn forward(&self, inputs: &[&Value]) -> Result<Vec<Value>> {
        match &self.kind {
            LayerKind::Input => inputs
                .first()
                .map(|x| vec![(*x).clone()])
                .ok_or_else(|| {
                    Error::InvalidGraph(format!("Input layer '{}' received no value", self.name))
                }),
            LayerKind::Operator(op) => op.forward(inputs),
            LayerKind::Container(model) => {
                let owned: Vec<Value> = inputs.iter().map(|x| (*x).clone()).collect();
                model.evaluate(&owned)
            }
        }
    }

    /// Create an unapplied copy with the same configuration and weights
    pub fn copy(&self) -> Result<LayerRef> {
        copy_layer(self, None)
    }

    pub(crate) fn install_recorder(&self, log: Arc<CallLog>) -> Result<()> {
        let mut slot = lock(&self.recorder);
        if slot.is_some() {
            return Err(Error::ReentrantInstrumentation(self.name.clone()));
        }
        *slot = Some(log);
        Ok(())
    }

    pub(crate) fn remove_recorder(&self) {
        lock(&self.recorder).take();
    }

    pub fn is_instrumented(&self) -> bool {
        lock(&self.recorder).is_some()
    }
}

/// Copy a layer from its configuration, optionally replacing its weights
pub fn copy_layer(layer: &Layer, weights: Option<Vec<Value>>) -> Result<LayerRef> {
    match &layer.kind {
        LayerKind::Input => Ok(Layer::input(layer.name.clone())),
        LayerKind::Operator(op) => {
            let mut copy = op.clone_operator();
            if let Some(weights) = weights {
                copy.set_weights(weights)?;
            }
            Ok(Layer::from_operator(layer.name.clone(), copy))
        }
        LayerKind::Container(_) => Err(Error::InvalidOperator(format!(
            "Container layer '{}' cannot be copied",
            layer.name
        ))),
    }
}

/// The single weight array of rank greater than one
pub fn get_kernel(layer: &Layer) -> Result<Value> {
    let mut kernels = layer.weights().into_iter().filter(|w| w.ndim() > 1);
    match (kernels.next(), kernels.next()) {
        (Some(kernel), None) => Ok(kernel),
        _ => Err(Error::InvalidOperator(format!(
            "Layer '{}' does not have exactly one kernel",
            layer.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Activation, ActivationKind, Dense};
    use ndarray::{arr1, arr2};

    #[test]
    fn test_call_records_inbound_nodes() {
        let layer = Layer::new("relu", Activation::new(ActivationKind::Relu));
        let x = TensorId::fresh();

        let ys = layer.call(&[x]).unwrap();
        assert_eq!(ys.len(), 1);
        assert_ne!(ys[0], x);
        assert_eq!(layer.inbound_count(), 1);
        assert_eq!(layer.input_at(0).unwrap(), vec![x]);
        assert_eq!(layer.output_at(0).unwrap(), ys);
        assert!(layer.input_at(1).is_err());
    }

    #[test]
    fn test_copy_layer_keeps_weights() {
        let dense = Dense::new(arr2(&[[1.0, 2.0]])).with_bias(arr1(&[0.5, 0.5])).unwrap();
        let layer = Layer::new("dense", dense);
        let copy = layer.copy().unwrap();

        assert_ne!(copy.id(), layer.id());
        assert_eq!(copy.weights(), layer.weights());
        assert_eq!(copy.inbound_count(), 0);

        let replaced = copy_layer(
            &layer,
            Some(vec![arr2(&[[3.0, 4.0]]).into_dyn(), arr1(&[0.0, 0.0]).into_dyn()]),
        )
        .unwrap();
        assert_eq!(get_kernel(&replaced).unwrap(), arr2(&[[3.0, 4.0]]).into_dyn());
    }

    #[test]
    fn test_get_kernel_requires_one_kernel() {
        let layer = Layer::new("relu", Activation::new(ActivationKind::Relu));
        assert!(get_kernel(&layer).is_err());
    }

    #[test]
    fn test_recorder_cannot_be_installed_twice() {
        let layer = Layer::new("relu", Activation::default());
        let log = Arc::new(CallLog::default());

        layer.install_recorder(Arc::clone(&log)).unwrap();
        assert!(matches!(
            layer.install_recorder(Arc::clone(&log)),
            Err(Error::ReentrantInstrumentation(_))
        ));
        assert!(log.is_empty());
        layer.call(&[TensorId::fresh()]).unwrap();
        assert_eq!(log.len(), 1);

        layer.remove_recorder();
        assert!(!layer.is_instrumented());
        layer.call(&[TensorId::fresh()]).unwrap();
        assert_eq!(log.len(), 1);
    }
}
