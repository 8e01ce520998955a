//! Client runtime for server-driven layouts: aspect stores, bindings, ties,
//! the transform interpreter and the websocket protocol session.

mod backend;
pub use backend::{Backend, HttpBackend};
pub mod binding;
mod component;
pub use component::{Component, ComponentRegistry, Constructor, Headless};
mod config;
pub mod dispatch;
mod error;
pub mod hydrate;
pub mod protocol;
pub mod requirements;
mod session;
mod storage;
mod store;
pub mod transform;
pub mod transport;

pub use binding::{AspectRef, Binding, BindingTable, Tie, Trigger};
pub use config::SessionConfig;
pub use dispatch::{Action, Dispatcher};
pub use error::{
    AssetLoadError, BackendError, ConnectionError, HydrateError, ProtocolError, SessionError,
    StoreError,
};
pub use hydrate::{ComponentNode, Node};
pub use protocol::{AspectValue, BindingMessage, Bootstrap, CallResponse, ClientFrame, ServerFrame};
pub use requirements::{
    AssetHost, DocumentHead, HttpAssetHost, Package, Requirement, RequirementKind,
    RequirementLoader,
};
pub use session::{SessionBuilder, SessionEvent, SessionHandle, SessionState};
pub use storage::{FileStorage, MemoryStorage, StorageArea, WebStorage};
pub use store::{AspectStore, Aspects, Mounted, RESERVED_KEYS, Registry, is_reserved};
pub use transform::{AspectSource, NoAspects, Transform};
pub use transport::{Connection, Connector, Peer, WsConnector};
