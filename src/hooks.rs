//! Router hook extension point
//!
//! Observers attach to a routing gate through [`HookRegistry`] instead of editing the
//! host's source. [`TracedGate`] wraps any [`RouterGate`], forwards the call unchanged
//! and hands the produced logits to every registered hook.
//!
//! ```text
//! hidden ─► TracedGate ─► inner.gate() ─► logits ─► caller
//!                                          │
//!                                          └─► registry.dispatch(logits, layer_id)
//! ```

use std::fmt;

use ndarray::Array2;

use crate::errors::{Result, RouteMapError};

/// Observer of router logits
///
/// Hooks run synchronously inside the host forward pass and must not panic.
pub trait RouterHook: Send + Sync {
    /// Identity used to keep registration idempotent
    fn name(&self) -> &str;

    fn on_router_logits(&self, logits: &Array2<f32>, layer_id: i64);
}

/// The scoring half of a Mixture-of-Experts layer
pub trait RouterGate {
    fn num_experts(&self) -> usize;

    /// Map hidden states (num_tokens, hidden_dim) to router logits (num_tokens, num_experts)
    fn gate(&self, hidden: &Array2<f32>) -> Array2<f32>;
}

/// Ordered set of uniquely named hooks
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn RouterHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hook after the existing ones
    ///
    /// # Errors
    /// Returns `RouteMapError::HookAlreadyRegistered` if a hook with the same name is present;
    /// the registry is left unchanged.
    pub fn register(&mut self, hook: Box<dyn RouterHook>) -> Result<()> {
        if self.is_registered(hook.name()) {
            return Err(RouteMapError::HookAlreadyRegistered {
                name: hook.name().to_string(),
            });
        }
        tracing::debug!(hook = hook.name(), "registered router hook");
        self.hooks.push(hook);
        Ok(())
    }

    /// Remove the hook called `name`. Returns whether one was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        before != self.hooks.len()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.name() == name)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Call every hook in registration order
    pub fn dispatch(&self, logits: &Array2<f32>, layer_id: i64) {
        for hook in &self.hooks {
            hook.on_router_logits(logits, layer_id);
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.hooks.iter().map(|h| h.name()))
            .finish()
    }
}

/// Gate decorator that reports its logits to a hook registry
#[derive(Debug)]
pub struct TracedGate<G: RouterGate> {
    inner: G,
    layer_id: i64,
    hooks: HookRegistry,
}

impl<G: RouterGate> TracedGate<G> {
    pub fn new(inner: G, layer_id: i64) -> Self {
        TracedGate {
            inner,
            layer_id,
            hooks: HookRegistry::new(),
        }
    }

    pub fn layer_id(&self) -> i64 {
        self.layer_id
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn into_inner(self) -> G {
        self.inner
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }
}

impl<G: RouterGate> RouterGate for TracedGate<G> {
    fn num_experts(&self) -> usize {
        self.inner.num_experts()
    }

    fn gate(&self, hidden: &Array2<f32>) -> Array2<f32> {
        let logits = self.inner.gate(hidden);
        if !self.hooks.is_empty() {
            self.hooks.dispatch(&logits, self.layer_id);
        }
        logits
    }
}
