use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Result};
use crate::model::{Layer, LayerId, LayerRef, Model, TensorId};
use crate::ops::Value;

/// Information handed to a reverse mapping at each node it reverses
#[derive(Debug, Clone, Copy)]
pub struct ReverseContext<'a> {
    /// Position of the node among the non-input steps
    pub reverse_node_id: usize,
    pub model: &'a Model,
    pub layer: &'a LayerRef,
    pub inputs: &'a [TensorId],
    pub outputs: &'a [TensorId],
}

/// Information handed to a stateful mapping factory
#[derive(Debug, Clone, Copy)]
pub struct ModelContext<'a> {
    pub model: &'a Model,
    pub layer: &'a LayerRef,
}

/// Backward function of one layer.
///
/// Receives the forward inputs `xs`, the forward outputs `ys` and the reversed
/// outputs, and returns one reversed value per input.
pub trait ReverseMapping: Send {
    fn apply(
        &mut self,
        xs: &[&Value],
        ys: &[&Value],
        reversed_ys: &[Value],
        ctx: &ReverseContext<'_>,
    ) -> Result<Vec<Value>>;
}

pub type ReverseFn =
    dyn Fn(&[&Value], &[&Value], &[Value], &ReverseContext<'_>) -> Result<Vec<Value>> + Send + Sync;

pub type MappingFactory =
    dyn Fn(&LayerRef, &ModelContext<'_>) -> Result<Box<dyn ReverseMapping>> + Send + Sync;

pub type Resolver = dyn Fn(&Layer) -> Option<ReverseHandler> + Send + Sync;

/// How a layer is reversed
#[derive(Clone)]
pub enum ReverseHandler {
    /// A plain function, called at every node
    Stateless(Arc<ReverseFn>),
    /// A factory run once per layer; the mapping it builds serves every node of that layer
    Stateful(Arc<MappingFactory>),
}

impl ReverseHandler {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[&Value], &[&Value], &[Value], &ReverseContext<'_>) -> Result<Vec<Value>>
            + Send
            + Sync
            + 'static,
    {
        ReverseHandler::Stateless(Arc::new(f))
    }

    pub fn factory<F>(f: F) -> Self
    where
        F: Fn(&LayerRef, &ModelContext<'_>) -> Result<Box<dyn ReverseMapping>> + Send + Sync + 'static,
    {
        ReverseHandler::Stateful(Arc::new(f))
    }

    fn instantiate(&self, layer: &LayerRef, model: &Model) -> Result<Box<dyn ReverseMapping>> {
        match self {
            ReverseHandler::Stateless(f) => Ok(Box::new(FunctionMapping(Arc::clone(f)))),
            ReverseHandler::Stateful(factory) => factory(layer, &ModelContext { model, layer }),
        }
    }
}

impl fmt::Debug for ReverseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReverseHandler::Stateless(_) => f.write_str("Stateless"),
            ReverseHandler::Stateful(_) => f.write_str("Stateful"),
        }
    }
}

struct FunctionMapping(Arc<ReverseFn>);

impl ReverseMapping for FunctionMapping {
    fn apply(
        &mut self,
        xs: &[&Value],
        ys: &[&Value],
        reversed_ys: &[Value],
        ctx: &ReverseContext<'_>,
    ) -> Result<Vec<Value>> {
        (self.0)(xs, ys, reversed_ys, ctx)
    }
}

/// Mapping instantiated for each layer of a trace; `None` marks an unsupported layer
pub(crate) type InitializedMappings = HashMap<LayerId, Option<Box<dyn ReverseMapping>>>;

/// Registry resolving one reverse handler per layer.
///
/// Resolution order: the resolver, then the handler registered for the
/// layer's class, then the default handler.
#[derive(Default)]
pub struct ReverseMappingRegistry {
    resolver: Option<Box<Resolver>>,
    by_class: HashMap<String, ReverseHandler>,
    default: Option<ReverseHandler>,
}

impl ReverseMappingRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult `resolver` before any other lookup
    pub fn with_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&Layer) -> Option<ReverseHandler> + Send + Sync + 'static,
    {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Handler used when nothing else matches
    pub fn with_default(mut self, handler: ReverseHandler) -> Self {
        self.default = Some(handler);
        self
    }

    /// Register a handler for all layers of a class
    pub fn register_class(&mut self, class_name: &str, handler: ReverseHandler) -> Result<()> {
        if self.by_class.contains_key(class_name) {
            return Err(Error::InvalidOperator(format!(
                "Reverse mapping for {} is already registered",
                class_name
            )));
        }

        self.by_class.insert(class_name.to_string(), handler);
        Ok(())
    }

    /// Find the handler for a layer
    pub fn resolve(&self, layer: &Layer) -> Option<ReverseHandler> {
        if let Some(handler) = self.resolver.as_ref().and_then(|resolve| resolve(layer)) {
            return Some(handler);
        }
        self.by_class
            .get(layer.class_name())
            .or(self.default.as_ref())
            .cloned()
    }

    pub fn is_supported(&self, layer: &Layer) -> bool {
        self.resolve(layer).is_some()
    }

    /// Instantiate one mapping per distinct layer.
    ///
    /// Input and container layers are never reversed and get no entry.
    /// Layers without a handler map to `None` so the error surfaces only if
    /// the reverse walk actually reaches them.
    pub(crate) fn initialize(&self, layers: &[LayerRef], model: &Model) -> Result<InitializedMappings> {
        let mut mappings = HashMap::with_capacity(layers.len());

        for layer in layers {
            if layer.is_input() || layer.is_container() {
                continue;
            }
            let mapping = match self.resolve(layer) {
                Some(handler) => Some(handler.instantiate(layer, model)?),
                None => {
                    debug!("No reverse mapping for layer '{}' ({})", layer.name(), layer.class_name());
                    None
                }
            };
            mappings.insert(layer.id(), mapping);
        }

        Ok(mappings)
    }
}

impl fmt::Debug for ReverseMappingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&String> = self.by_class.keys().collect();
        classes.sort();
        f.debug_struct("ReverseMappingRegistry")
            .field("resolver", &self.resolver.is_some())
            .field("classes", &classes)
            .field("default", &self.default)
            .finish()
    }
}
