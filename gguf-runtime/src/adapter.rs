//! LoRA adapters.
//!
//! An adapter is created detached from a file path and attached through
//! [`Model::attach_adapter`]. While attached it holds a strong reference to
//! its model and the model lists it, so neither goes away first. The pair is
//! separated by [`Model::detach_adapter`] or by disposing the model, which
//! frees every attached adapter before the model itself.

use crate::engine::NativeAdapter;
use crate::error::{ModelError, Result};
use crate::model::{Model, OwnedLease};
use crate::task::AsyncTask;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

enum AdapterState {
    Detached,
    Attaching,
    Attached { native: NativeAdapter, model: Arc<Model> },
}

pub struct LoraAdapter {
    path: PathBuf,
    state: Mutex<AdapterState>,
}

impl fmt::Debug for LoraAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoraAdapter")
            .field("path", &self.path)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl LoraAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            state: Mutex::new(AdapterState::Detached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_attached(&self) -> bool {
        matches!(*self.state.lock(), AdapterState::Attached { .. })
    }

    /// Model this adapter is attached to
    pub fn model(&self) -> Option<Arc<Model>> {
        match &*self.state.lock() {
            AdapterState::Attached { model, .. } => Some(model.clone()),
            _ => None,
        }
    }

    pub(crate) fn begin_attach(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            AdapterState::Detached => {
                *state = AdapterState::Attaching;
                Ok(())
            }
            _ => Err(ModelError::AdapterAlreadyAttached),
        }
    }

    pub(crate) fn cancel_attach(&self) {
        let mut state = self.state.lock();
        if matches!(*state, AdapterState::Attaching) {
            *state = AdapterState::Detached;
        }
    }

    fn finish_attach(&self, native: NativeAdapter, model: Arc<Model>) {
        *self.state.lock() = AdapterState::Attached { native, model };
    }

    /// Free the native adapter and drop the model reference
    pub(crate) fn release(&self) {
        let previous = {
            let mut state = self.state.lock();
            if !matches!(*state, AdapterState::Attached { .. }) {
                return;
            }
            std::mem::replace(&mut *state, AdapterState::Detached)
        };
        if let AdapterState::Attached { native, model } = previous {
            model.engine().adapter_free(native);
            log::debug!("Released adapter {}", self.path.display());
            // Dropped outside the state lock; may be the last model reference
            drop(model);
        }
    }
}

impl Drop for LoraAdapter {
    fn drop(&mut self) {
        self.release();
    }
}

/// Background initialisation of one adapter against a leased model
pub(crate) struct AttachTask {
    lease: OwnedLease,
    adapter: Arc<LoraAdapter>,
}

impl AttachTask {
    pub(crate) fn new(lease: OwnedLease, adapter: Arc<LoraAdapter>) -> Self {
        Self { lease, adapter }
    }
}

impl AsyncTask for AttachTask {
    type Output = NativeAdapter;
    type Resolved = ();

    fn name(&self) -> &'static str {
        "adapter attach"
    }

    fn execute(&mut self) -> Result<NativeAdapter> {
        let engine = self.lease.model().engine();
        engine
            .adapter_init(self.lease.native(), &self.adapter.path)
            .ok_or_else(|| ModelError::AdapterInitError(self.adapter.path.display().to_string()))
    }

    fn complete(self, outcome: Result<NativeAdapter>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let AttachTask { lease, adapter } = self;
            let model = lease.model().clone();

            let native = match outcome {
                Ok(native) => native,
                Err(e) => {
                    adapter.cancel_attach();
                    log::warn!("Attaching adapter {} failed: {}", adapter.path.display(), e);
                    return Err(e);
                }
            };

            adapter.finish_attach(native, model.clone());
            if model.register_adapter(adapter.clone()) {
                log::info!("Attached adapter {} to {}", adapter.path.display(), model.path().display());
                Ok(())
            } else {
                // Dispose began while the adapter was initialising
                adapter.release();
                log::warn!(
                    "Model {} was disposed while attaching adapter {}",
                    model.path().display(),
                    adapter.path.display()
                );
                Err(ModelError::ModelDataTornDown)
            }
        })
    }
}
