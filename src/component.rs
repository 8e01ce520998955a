//! Host-side component constructors keyed by `(package, component)`.
//!
//! A server layout names components by package and component name. The
//! host registers a constructor for every component its packages provide,
//! and hydration looks them up here instead of reflecting over a global
//! namespace.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HydrateError;
use crate::store::AspectStore;

/// A mounted host component.
///
/// Rendering is entirely up to the host; the session only tells the
/// component when its aspects changed and when it is torn down.
pub trait Component: Send + Sync + 'static {
    /// Called after a server push, tie write or call output merged into the
    /// component's store.
    fn aspects_changed(&self, _store: &AspectStore, _names: &[String]) {}

    /// Called once the component's store has been deregistered.
    fn unmounted(&self, _identity: &str) {}
}

/// A component with no host-side behaviour.
#[derive(Debug, Clone, Copy, Default)]
pub struct Headless;

impl Component for Headless {}

/// Builds a host component for a freshly created store.
pub type Constructor = Arc<dyn Fn(&AspectStore) -> Arc<dyn Component> + Send + Sync>;

/// Registry of component constructors.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    constructors: HashMap<(String, String), Constructor>,
    fallback: Option<Constructor>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.constructors.keys().collect();
        keys.sort();
        f.debug_struct("ComponentRegistry")
            .field("constructors", &keys)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ComponentRegistry {
    /// Create an empty registry with no fallback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `component` in `package`.
    pub fn register<F>(
        &mut self,
        package: impl Into<String>,
        component: impl Into<String>,
        constructor: F,
    ) -> &mut Self
    where
        F: Fn(&AspectStore) -> Arc<dyn Component> + Send + Sync + 'static,
    {
        self.constructors
            .insert((package.into(), component.into()), Arc::new(constructor));
        self
    }

    /// Register a [`Headless`] component for `component` in `package`.
    pub fn register_headless(
        &mut self,
        package: impl Into<String>,
        component: impl Into<String>,
    ) -> &mut Self {
        self.register(package, component, |_| Arc::new(Headless))
    }

    /// Use `constructor` for any component that has no registered constructor.
    pub fn fallback<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&AspectStore) -> Arc<dyn Component> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(constructor));
        self
    }

    /// Mount unknown components as [`Headless`] instead of failing.
    pub fn headless_fallback(self) -> Self {
        self.fallback(|_| Arc::new(Headless))
    }

    /// Whether any constructor was registered for `package`.
    pub fn has_package(&self, package: &str) -> bool {
        self.constructors.keys().any(|(p, _)| p == package)
    }

    /// Construct the host component for `store`.
    ///
    /// # Errors
    ///
    /// Returns [`HydrateError::UnknownComponent`] if neither a constructor
    /// nor a fallback is available.
    pub fn construct(&self, store: &AspectStore) -> Result<Arc<dyn Component>, HydrateError> {
        let key = (
            store.package_name().to_owned(),
            store.component_name().to_owned(),
        );
        let constructor = self
            .constructors
            .get(&key)
            .or(self.fallback.as_ref())
            .ok_or_else(|| HydrateError::UnknownComponent {
                package: key.0.clone(),
                component: key.1.clone(),
            })?;
        Ok(constructor(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::detached_sink_store;
    use std::sync::Mutex;

    struct Named(&'static str, Arc<Mutex<Vec<String>>>);

    impl Component for Named {
        fn unmounted(&self, identity: &str) {
            self.1.lock().unwrap().push(format!("{}:{identity}", self.0));
        }
    }

    #[test]
    fn unknown_component_without_fallback_fails() {
        let registry = ComponentRegistry::new();
        let store = detached_sink_store("x", serde_json::json!({}));
        let err = registry.construct(&store).err().expect("unknown");
        assert_eq!(
            err.to_string(),
            "no component `Widget` registered in package `test`"
        );
    }

    #[test]
    fn registered_constructor_is_used() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ComponentRegistry::new();
        let sink = Arc::clone(&log);
        registry.register("test", "Widget", move |_| {
            Arc::new(Named("widget", Arc::clone(&sink)))
        });
        assert!(registry.has_package("test"));
        assert!(!registry.has_package("other"));

        let store = detached_sink_store("w-1", serde_json::json!({}));
        let component = registry.construct(&store).expect("registered");
        component.unmounted("w-1");
        assert_eq!(*log.lock().unwrap(), vec!["widget:w-1".to_string()]);
    }

    #[test]
    fn fallback_covers_unregistered_components() {
        let registry = ComponentRegistry::new().headless_fallback();
        let store = detached_sink_store("x", serde_json::json!({}));
        assert!(registry.construct(&store).is_ok());
    }
}
