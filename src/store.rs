//! Per-component aspect storage and the registry of mounted components.
//!
//! Every mounted component owns one [`AspectStore`]. Local merges are
//! immediate; [`AspectStore::update_aspects`] additionally notifies the
//! owning session so bindings and ties can fire. The session keeps the
//! live stores in a [`Registry`] and is the only party that registers or
//! deregisters them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};

use crate::component::Component;
use crate::error::StoreError;
use crate::transform::AspectSource;

/// Aspect name to value map, as carried on the wire.
pub type Aspects = Map<String, Value>;

/// Keys used by the framework for its own bookkeeping.
///
/// They are never stored as aspects, so they can never leak into a binding
/// payload or a tie write.
pub const RESERVED_KEYS: &[&str] = &[
    "identity",
    "updateAspects",
    "setAspects",
    "getAspect",
    "matchAspects",
];

/// Returns `true` if `name` is a framework bookkeeping key.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_KEYS.contains(&name)
}

/// Notification sent from a store to its session after a local merge.
pub(crate) struct AspectUpdate {
    /// Identity of the store that changed.
    pub identity: String,
    /// The aspects that were actually merged (reserved keys removed).
    pub partial: Aspects,
    /// Completed once the session finished the resulting dispatch pass.
    pub done: oneshot::Sender<()>,
}

/// Channel through which stores notify their session.
pub(crate) type UpdateSink = mpsc::UnboundedSender<AspectUpdate>;

struct StoreInner {
    identity: String,
    package_name: String,
    component_name: String,
    aspects: RwLock<Aspects>,
    version: watch::Sender<u64>,
    connected: AtomicBool,
    sink: UpdateSink,
}

/// Key/value store holding the aspects of one component instance.
///
/// `Clone` is cheap: clones share the same underlying state.
#[derive(Clone)]
pub struct AspectStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for AspectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AspectStore")
            .field("identity", &self.inner.identity)
            .field("package_name", &self.inner.package_name)
            .field("component_name", &self.inner.component_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl AspectStore {
    /// Create a connected store seeded with `aspects`.
    pub(crate) fn new(
        identity: impl Into<String>,
        package_name: impl Into<String>,
        component_name: impl Into<String>,
        aspects: Aspects,
        sink: UpdateSink,
    ) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                identity: identity.into(),
                package_name: package_name.into(),
                component_name: component_name.into(),
                aspects: RwLock::new(strip_reserved(aspects)),
                version,
                connected: AtomicBool::new(true),
                sink,
            }),
        }
    }

    /// Identity of the component this store belongs to.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Package the component was constructed from.
    pub fn package_name(&self) -> &str {
        &self.inner.package_name
    }

    /// Component name within its package.
    pub fn component_name(&self) -> &str {
        &self.inner.component_name
    }

    /// Current value of one aspect, or `None` if it was never set.
    pub fn get_aspect(&self, name: &str) -> Option<Value> {
        self.read().get(name).cloned()
    }

    /// Snapshot of every aspect.
    pub fn aspects(&self) -> Aspects {
        self.read().clone()
    }

    /// Merge `partial` locally without notifying the session.
    ///
    /// The merge is shallow (each key overwrites) and is observable as soon
    /// as this call returns.
    pub fn set_aspects(&self, partial: Aspects) {
        self.merge(partial);
    }

    /// Snapshot of all aspects whose name matches `pattern`.
    pub fn match_aspects(&self, pattern: &Regex) -> Vec<(String, Value)> {
        self.read()
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Merge `partial` locally and let the session dispatch bindings and ties.
    ///
    /// Resolves once the session has finished the dispatch pass triggered by
    /// this update (outgoing frames sent, tie writes applied).
    ///
    /// # Errors
    ///
    /// * [`StoreError::Detached`] -- the component was unmounted.
    /// * [`StoreError::SessionGone`] -- the session has shut down.
    pub async fn update_aspects(&self, partial: Aspects) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::Detached(self.inner.identity.clone()));
        }
        let merged = self.merge(partial);
        if merged.is_empty() {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        self.inner
            .sink
            .send(AspectUpdate {
                identity: self.inner.identity.clone(),
                partial: merged,
                done,
            })
            .map_err(|_| StoreError::SessionGone)?;
        rx.await.map_err(|_| StoreError::SessionGone)
    }

    /// Watch the store's version counter, bumped on every merge.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Whether the store is still mounted.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Merge and return the entries that were actually applied.
    pub(crate) fn merge(&self, partial: Aspects) -> Aspects {
        let partial = strip_reserved(partial);
        if partial.is_empty() {
            return partial;
        }
        {
            let mut aspects = self
                .inner
                .aspects
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (name, value) in &partial {
                aspects.insert(name.clone(), value.clone());
            }
        }
        self.inner.version.send_modify(|v| *v += 1);
        partial
    }

    pub(crate) fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::Release);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Aspects> {
        self.inner
            .aspects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn strip_reserved(mut aspects: Aspects) -> Aspects {
    aspects.retain(|name, _| !is_reserved(name));
    aspects
}

/// A mounted component: its store plus the host-side component instance.
#[derive(Clone)]
pub struct Mounted {
    /// The component's aspect store.
    pub store: AspectStore,
    /// The host component constructed for it.
    pub component: Arc<dyn Component>,
}

impl std::fmt::Debug for Mounted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mounted")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Identity-keyed registry of mounted components.
///
/// Owned by the session. Iteration is in identity order so that regex
/// fan-out produces deterministic frames.
#[derive(Debug, Default)]
pub struct Registry {
    mounted: BTreeMap<String, Mounted>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, replacing (and disconnecting) any previous
    /// component with the same identity.
    pub fn register(&mut self, mounted: Mounted) -> Option<Mounted> {
        let identity = mounted.store.identity().to_owned();
        let previous = self.mounted.insert(identity, mounted);
        if let Some(previous) = &previous {
            previous.store.disconnect();
        }
        previous
    }

    /// Remove a component and disconnect its store.
    ///
    /// The component's [`Component::unmounted`] hook runs after the store is
    /// disconnected, so nothing dispatched afterwards can reach it.
    pub fn deregister(&mut self, identity: &str) -> Option<Mounted> {
        let mounted = self.mounted.remove(identity)?;
        mounted.store.disconnect();
        mounted.component.unmounted(identity);
        Some(mounted)
    }

    /// Deregister everything.
    pub fn clear(&mut self) {
        let identities: Vec<String> = self.mounted.keys().cloned().collect();
        for identity in identities {
            self.deregister(&identity);
        }
    }

    /// Store registered under `identity`.
    pub fn get(&self, identity: &str) -> Option<&AspectStore> {
        self.mounted.get(identity).map(|m| &m.store)
    }

    /// Mounted entry registered under `identity`.
    pub fn mounted(&self, identity: &str) -> Option<&Mounted> {
        self.mounted.get(identity)
    }

    /// Whether `identity` is currently mounted.
    pub fn contains(&self, identity: &str) -> bool {
        self.mounted.contains_key(identity)
    }

    /// Iterate over mounted identities in order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.mounted.keys().map(String::as_str)
    }

    /// Iterate over mounted stores in identity order.
    pub fn stores(&self) -> impl Iterator<Item = &AspectStore> {
        self.mounted.values().map(|m| &m.store)
    }

    /// Number of mounted components.
    pub fn len(&self) -> usize {
        self.mounted.len()
    }

    /// Whether nothing is mounted.
    pub fn is_empty(&self) -> bool {
        self.mounted.is_empty()
    }
}

impl AspectSource for Registry {
    fn get_aspect(&self, identity: &str, aspect: &str) -> Option<Value> {
        self.get(identity)?.get_aspect(aspect)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::component::Headless;

    /// A store wired to a sink nobody listens on.
    pub(crate) fn detached_sink_store(identity: &str, aspects: Value) -> AspectStore {
        let (sink, _rx) = mpsc::unbounded_channel();
        AspectStore::new(identity, "test", "Widget", as_map(aspects), sink)
    }

    pub(crate) fn mounted(identity: &str, aspects: Value) -> Mounted {
        Mounted {
            store: detached_sink_store(identity, aspects),
            component: Arc::new(Headless),
        }
    }

    pub(crate) fn as_map(value: Value) -> Aspects {
        match value {
            Value::Object(map) => map,
            _ => Aspects::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn new_store_strips_reserved_keys() {
        let store = detached_sink_store(
            "btn",
            json!({"identity": "btn", "updateAspects": 1, "text": "ok"}),
        );
        assert_eq!(store.aspects(), as_map(json!({"text": "ok"})));
    }

    #[test]
    fn set_aspects_merges_shallowly_and_bumps_version() {
        let store = detached_sink_store("btn", json!({"a": {"x": 1}, "b": 2}));
        let rx = store.subscribe();
        store.set_aspects(as_map(json!({"a": {"y": 2}, "c": 3})));
        assert_eq!(store.get_aspect("a"), Some(json!({"y": 2})));
        assert_eq!(store.get_aspect("b"), Some(json!(2)));
        assert_eq!(store.get_aspect("c"), Some(json!(3)));
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn merge_of_only_reserved_keys_is_a_noop() {
        let store = detached_sink_store("btn", json!({"a": 1}));
        let rx = store.subscribe();
        let merged = store.merge(as_map(json!({"getAspect": 1})));
        assert!(merged.is_empty());
        assert_eq!(*rx.borrow(), 0);
    }

    #[test]
    fn match_aspects_filters_by_name() {
        let store = detached_sink_store(
            "form",
            json!({"field_name": "a", "field_age": 3, "title": "t"}),
        );
        let re = Regex::new("^field_").unwrap();
        let mut matched = store.match_aspects(&re);
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            matched,
            vec![
                ("field_age".to_string(), json!(3)),
                ("field_name".to_string(), json!("a")),
            ]
        );
    }

    #[tokio::test]
    async fn update_aspects_notifies_session_and_waits_for_dispatch() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let store = AspectStore::new("btn", "pkg", "Button", Aspects::new(), sink);

        let session = tokio::spawn(async move {
            let update = rx.recv().await.expect("update");
            assert_eq!(update.identity, "btn");
            assert_eq!(update.partial, as_map(json!({"clicks": 1})));
            let _ = update.done.send(());
        });

        store
            .update_aspects(as_map(json!({"clicks": 1, "identity": "evil"})))
            .await
            .expect("update should resolve");
        session.await.expect("session task");
        assert_eq!(store.get_aspect("clicks"), Some(json!(1)));
        assert_eq!(store.get_aspect("identity"), None);
    }

    #[tokio::test]
    async fn update_aspects_on_detached_store_fails() {
        let store = detached_sink_store("btn", json!({}));
        store.disconnect();
        let err = store
            .update_aspects(as_map(json!({"a": 1})))
            .await
            .expect_err("detached");
        assert!(matches!(err, StoreError::Detached(id) if id == "btn"));
    }

    #[tokio::test]
    async fn update_aspects_without_session_reports_gone() {
        let store = detached_sink_store("btn", json!({}));
        let err = store
            .update_aspects(as_map(json!({"a": 1})))
            .await
            .expect_err("no session");
        assert!(matches!(err, StoreError::SessionGone));
    }

    #[test]
    fn deregister_disconnects_store() {
        let mut registry = Registry::new();
        let entry = mounted("row-1", json!({"v": 1}));
        let store = entry.store.clone();
        registry.register(entry);
        assert!(registry.contains("row-1"));
        assert_eq!(registry.get_aspect("row-1", "v"), Some(json!(1)));

        let removed = registry.deregister("row-1").expect("was mounted");
        assert!(!removed.store.is_connected());
        assert!(!store.is_connected());
        assert!(registry.get("row-1").is_none());
    }

    #[test]
    fn register_replaces_and_disconnects_previous() {
        let mut registry = Registry::new();
        let first = mounted("x", json!({}));
        let first_store = first.store.clone();
        registry.register(first);
        registry.register(mounted("x", json!({})));
        assert!(!first_store.is_connected());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn identities_iterate_in_order() {
        let mut registry = Registry::new();
        for id in ["b", "c", "a"] {
            registry.register(mounted(id, json!({})));
        }
        assert_eq!(registry.identities().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        registry.clear();
        assert!(registry.is_empty());
    }
}
