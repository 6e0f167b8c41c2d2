//! Registries mapping orchestration and activity names to handlers.
//!
//! One generic immutable `Registry<H>` backs both: orchestrations store
//! `dyn OrchestrationHandler`, activities store `dyn ActivityHandler`.
//! Built once through a builder, then shared cheaply across dispatchers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;

pub struct Registry<H: ?Sized> {
    inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone: H: ?Sized blocks the derive.
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl OrchestrationRegistryBuilder {
    /// Register an orchestrator function under a name.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, orchestrator: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map
            .insert(name.into(), Arc::new(FnOrchestration(orchestrator)));
        self
    }
}

impl ActivityRegistryBuilder {
    /// Register an infallible activity.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, activity: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        self.map.insert(
            name.into(),
            Arc::new(FnActivity(move |input| {
                let fut = activity(input);
                async move { Ok(fut.await) }
            })),
        );
        self
    }

    /// Register an activity that can fail; the error becomes the task's
    /// failure result, visible to orchestrator code as data.
    pub fn register_result<F, Fut>(mut self, name: impl Into<String>, activity: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(activity)));
        self
    }
}
