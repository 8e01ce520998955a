//! Turning dry layout values into mounted components.
//!
//! A layout is plain JSON in which some objects are *dry component
//! descriptors*: objects carrying `identity`, `package_name` and
//! `component_name` (plus an optional `aspects` object). Hydration walks the
//! value, builds a store and host component for every descriptor, and
//! returns a [`Node`] tree that mirrors the JSON shape.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::component::{Component, ComponentRegistry};
use crate::error::HydrateError;
use crate::store::{AspectStore, Mounted, Registry, UpdateSink};

/// A hydrated layout value.
#[derive(Clone)]
pub enum Node {
    /// Any JSON value that is neither a list, an object nor a component.
    Primitive(Value),
    /// A JSON array.
    List(Vec<Node>),
    /// A JSON object that is not a component descriptor.
    Map(BTreeMap<String, Node>),
    /// A mounted component.
    Component(ComponentNode),
}

/// A component inside a hydrated tree.
#[derive(Clone)]
pub struct ComponentNode {
    /// The component's store.
    pub store: AspectStore,
    /// The host component.
    pub component: Arc<dyn Component>,
    /// Hydrated initial aspects (nested components included).
    pub aspects: BTreeMap<String, Node>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::Primitive(value) => f.debug_tuple("Primitive").field(value).finish(),
            Node::List(items) => f.debug_tuple("List").field(items).finish(),
            Node::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Node::Component(node) => f
                .debug_struct("Component")
                .field("identity", &node.store.identity())
                .field("aspects", &node.aspects)
                .finish(),
        }
    }
}

impl Node {
    /// The component at the root of this node, if any.
    pub fn as_component(&self) -> Option<&ComponentNode> {
        match self {
            Node::Component(node) => Some(node),
            _ => None,
        }
    }

    /// Find a component by identity anywhere in the tree.
    pub fn find(&self, identity: &str) -> Option<&ComponentNode> {
        match self {
            Node::Primitive(_) => None,
            Node::List(items) => items.iter().find_map(|n| n.find(identity)),
            Node::Map(map) => map.values().find_map(|n| n.find(identity)),
            Node::Component(node) if node.store.identity() == identity => Some(node),
            Node::Component(node) => node.aspects.values().find_map(|n| n.find(identity)),
        }
    }
}

/// Borrowed view of a dry component descriptor.
#[derive(Debug, Clone, Copy)]
pub struct DryComponent<'a> {
    /// Component identity.
    pub identity: &'a str,
    /// Package providing the component.
    pub package_name: &'a str,
    /// Component name within the package.
    pub component_name: &'a str,
    /// Initial aspects, if any.
    pub aspects: Option<&'a Map<String, Value>>,
}

/// Recognize a dry component descriptor.
pub fn dry_component(value: &Value) -> Option<DryComponent<'_>> {
    let object = value.as_object()?;
    Some(DryComponent {
        identity: object.get("identity")?.as_str()?,
        package_name: object.get("package_name")?.as_str()?,
        component_name: object.get("component_name")?.as_str()?,
        aspects: object.get("aspects").and_then(Value::as_object),
    })
}

/// Collect the identities of every component described inside `value`.
pub fn component_identities(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|v| component_identities(v, out)),
        Value::Object(object) => {
            if let Some(dry) = dry_component(value) {
                out.insert(dry.identity.to_owned());
                if let Some(aspects) = dry.aspects {
                    aspects.values().for_each(|v| component_identities(v, out));
                }
            } else {
                object.values().for_each(|v| component_identities(v, out));
            }
        }
        _ => {}
    }
}

/// Hydrates values against the live registry.
///
/// Identities that are already mounted are reused as-is; new ones are
/// collected in post-order (children before their parent) and handed back
/// by [`finish`](Hydrator::finish) for the session to register.
pub(crate) struct Hydrator<'a> {
    components: &'a ComponentRegistry,
    registry: &'a Registry,
    sink: &'a UpdateSink,
    mounted: Vec<Mounted>,
}

impl<'a> Hydrator<'a> {
    pub(crate) fn new(
        components: &'a ComponentRegistry,
        registry: &'a Registry,
        sink: &'a UpdateSink,
    ) -> Self {
        Self {
            components,
            registry,
            sink,
            mounted: Vec::new(),
        }
    }

    pub(crate) fn hydrate(&mut self, value: &Value) -> Result<Node, HydrateError> {
        if let Some(dry) = dry_component(value) {
            return self.hydrate_component(dry).map(Node::Component);
        }
        Ok(match value {
            Value::Array(items) => Node::List(
                items
                    .iter()
                    .map(|item| self.hydrate(item))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(object) => Node::Map(self.hydrate_map(object)?),
            other => Node::Primitive(other.clone()),
        })
    }

    pub(crate) fn finish(self) -> Vec<Mounted> {
        self.mounted
    }

    fn hydrate_map(
        &mut self,
        object: &Map<String, Value>,
    ) -> Result<BTreeMap<String, Node>, HydrateError> {
        object
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.hydrate(value)?)))
            .collect()
    }

    fn hydrate_component(&mut self, dry: DryComponent<'_>) -> Result<ComponentNode, HydrateError> {
        let aspects = match dry.aspects {
            Some(aspects) => self.hydrate_map(aspects)?,
            None => BTreeMap::new(),
        };

        if let Some(existing) = self.lookup(dry.identity) {
            return Ok(ComponentNode {
                store: existing.store.clone(),
                component: Arc::clone(&existing.component),
                aspects,
            });
        }

        let store = AspectStore::new(
            dry.identity,
            dry.package_name,
            dry.component_name,
            dry.aspects.cloned().unwrap_or_default(),
            self.sink.clone(),
        );
        let component = self.components.construct(&store)?;
        self.mounted.push(Mounted {
            store: store.clone(),
            component: Arc::clone(&component),
        });
        Ok(ComponentNode {
            store,
            component,
            aspects,
        })
    }

    fn lookup(&self, identity: &str) -> Option<&Mounted> {
        self.registry.mounted(identity).or_else(|| {
            self.mounted
                .iter()
                .find(|m| m.store.identity() == identity)
        })
    }
}
