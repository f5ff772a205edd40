use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, trace};

use crate::error::Result;
use crate::model::{LayerId, LayerRef, TensorId};

/// One layer invocation observed while instrumented
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub layer: LayerId,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

/// Ordered log shared by every instrumented layer
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<RecordedCall>>,
}

impl CallLog {
    pub(crate) fn record(&self, layer: LayerId, inputs: &[TensorId], outputs: &[TensorId]) {
        trace!("Recorded call of {} ({} -> {} tensors)", layer, inputs.len(), outputs.len());
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                layer,
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
            });
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self) -> Vec<RecordedCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Guard keeping a set of layers instrumented.
///
/// Recorders are removed from every layer when the guard is dropped, which
/// covers early returns, errors and unwinding alike.
#[derive(Debug)]
pub struct Instrumentation {
    layers: Vec<LayerRef>,
    log: Arc<CallLog>,
}

impl Instrumentation {
    /// Install one shared recorder on every layer.
    ///
    /// Fails with `ReentrantInstrumentation` if a layer already carries a
    /// recorder; the layers instrumented so far are released again.
    pub fn install(layers: &[LayerRef]) -> Result<Self> {
        let mut guard = Self {
            layers: Vec::with_capacity(layers.len()),
            log: Arc::new(CallLog::default()),
        };

        for layer in layers {
            layer.install_recorder(Arc::clone(&guard.log))?;
            guard.layers.push(Arc::clone(layer));
        }

        debug!("Instrumented {} layers", guard.layers.len());
        Ok(guard)
    }

    /// Remove the recorders and return the calls observed so far
    pub fn finish(self) -> Vec<RecordedCall> {
        let calls = self.log.take();
        drop(self);
        calls
    }
}

impl Drop for Instrumentation {
    fn drop(&mut self) {
        for layer in &self.layers {
            layer.remove_recorder();
        }
        debug!("Released instrumentation of {} layers", self.layers.len());
    }
}

/// Run `f` with `layers` instrumented and return its result with the call log.
/// The instrumentation is always removed before this function returns.
pub fn with_instrumentation<T, F>(layers: &[LayerRef], f: F) -> Result<(T, Vec<RecordedCall>)>
where
    F: FnOnce() -> Result<T>,
{
    let guard = Instrumentation::install(layers)?;
    let value = f()?;
    Ok((value, guard.finish()))
}
