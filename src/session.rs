//! The protocol session: bootstrap, asset loading, websocket and dispatch.
//!
//! A session runs as a single tokio task that exclusively owns the socket,
//! the component [`Registry`] and the compiled [`Dispatcher`]. Everything
//! that touches them (incoming frames, store updates, binding call results,
//! handle commands) is funnelled into the task through channels and handled
//! to completion one at a time.
//!
//! Public API: [`SessionBuilder`] (configures and spawns a session) and
//! [`SessionHandle`] (cloneable handle for observing and controlling it).
//!
//! ```text
//! Bootstrapping -> LoadingRequirements -> Connecting -> Ready <-> Reloading
//!                                                                   \-> Refreshing
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use url::Url;

use crate::backend::{Backend, HttpBackend};
use crate::component::ComponentRegistry;
use crate::config::SessionConfig;
use crate::dispatch::{Action, Dispatcher};
use crate::error::{BackendError, HydrateError, ProtocolError, SessionError};
use crate::hydrate::{Hydrator, Node, component_identities};
use crate::protocol::{Bootstrap, BindingMessage, CallResponse, ClientFrame, ServerFrame};
use crate::requirements::{AssetHost, HttpAssetHost, Requirement, RequirementKind, RequirementLoader};
use crate::storage::{MemoryStorage, WebStorage};
use crate::store::{AspectStore, AspectUpdate, Aspects, Mounted, Registry, UpdateSink};
use crate::transport::{Connection, Connector, WsConnector, socket_url};

/// Capacity of the session event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Fetching the page bootstrap.
    Bootstrapping,
    /// Loading package and page requirements. A failed load parks the
    /// session here.
    LoadingRequirements,
    /// Opening (or re-opening) the websocket.
    Connecting,
    /// Live: frames are routed and bindings fire.
    Ready,
    /// A reload frame closed the socket; the next open triggers a remount
    /// or, for a refresh, enters `Refreshing`.
    Reloading,
    /// The server asked for a full reload and is reachable again. Terminal.
    Refreshing,
    /// Bootstrap or hydration failed. Terminal.
    Failed,
    /// Reconnection retries are exhausted. Ties keep working; binding
    /// frames are dropped.
    Disconnected,
}

/// Notifications for the session's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The layout is mounted and the session is live.
    Ready,
    /// Code changed on the server; the tree was unmounted and is being
    /// rebuilt from a fresh bootstrap.
    Remount,
    /// The server requires a full reload of the page.
    Refresh,
    /// Retries are exhausted; the socket will not be reopened.
    ConnectionLost,
    /// Bootstrap, hydration or asset loading failed.
    Failed(String),
}

/// Requests from a [`SessionHandle`] to the session task.
enum Command {
    Store {
        identity: String,
        reply: oneshot::Sender<Option<AspectStore>>,
    },
    Unmount {
        identity: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Result of a binding `PATCH` performed off the session task.
struct CallOutcome {
    key: String,
    result: Result<CallResponse, BackendError>,
}

/// One queued dispatch pass.
struct Job {
    identity: String,
    changed: Aspects,
    initial: bool,
}

/// What the session task does next.
enum Next {
    Bootstrap,
    Serve,
    Park,
    Exit,
}

/// Builder for a protocol session.
///
/// Every collaborator has a default: [`HttpBackend`], [`WsConnector`] and
/// [`HttpAssetHost`] against the page URL, [`MemoryStorage`], and an empty
/// [`ComponentRegistry`].
///
/// # Examples
///
/// ```no_run
/// use aspect_sync::{ComponentRegistry, SessionBuilder};
///
/// # async fn run() -> Result<(), aspect_sync::SessionError> {
/// let session = SessionBuilder::new("http://localhost:8000/dashboard")
///     .retries(3)
///     .components(ComponentRegistry::new().headless_fallback())
///     .spawn()?;
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    page_url: String,
    config: SessionConfig,
    backend: Option<Arc<dyn Backend>>,
    connector: Option<Arc<dyn Connector>>,
    asset_host: Option<Arc<dyn AssetHost>>,
    storage: Option<Arc<dyn WebStorage>>,
    components: ComponentRegistry,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("page_url", &self.page_url)
            .field("config", &self.config)
            .field("components", &self.components)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Start configuring a session for the page at `page_url`.
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
            config: SessionConfig::default(),
            backend: None,
            connector: None,
            asset_host: None,
            storage: None,
            components: ComponentRegistry::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the websocket retry limit.
    pub fn retries(mut self, retries: u32) -> Self {
        self.config.retries = retries;
        self
    }

    /// Use a custom HTTP backend.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a custom socket connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a custom asset host.
    pub fn asset_host(mut self, host: Arc<dyn AssetHost>) -> Self {
        self.asset_host = Some(host);
        self
    }

    /// Use custom storage for `set-storage` / `get-storage`.
    pub fn storage(mut self, storage: Arc<dyn WebStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Component constructors used during hydration.
    pub fn components(mut self, components: ComponentRegistry) -> Self {
        self.components = components;
        self
    }

    /// Spawn the session task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidUrl`] if the page URL does not parse.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> Result<SessionHandle, SessionError> {
        let page_url = Url::parse(&self.page_url)?;
        let config = self.config;
        let backend: Arc<dyn Backend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(page_url.clone())),
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector::new(config.connect_timeout)),
        };
        let host: Arc<dyn AssetHost> = match self.asset_host {
            Some(host) => host,
            None => Arc::new(HttpAssetHost::new(page_url.clone())),
        };
        let storage: Arc<dyn WebStorage> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(MemoryStorage::new()),
        };

        let (sink, updates) = mpsc::unbounded_channel();
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Bootstrapping);
        let (layout_tx, layout_rx) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Session {
            loader: RequirementLoader::new(host, config.asset_timeout),
            page_url,
            config,
            backend,
            connector,
            storage,
            components: self.components,
            registry: Registry::new(),
            dispatcher: Dispatcher::default(),
            page: String::new(),
            stylesheets: Vec::new(),
            sink,
            updates,
            calls_tx,
            calls,
            commands,
            state: state_tx,
            layout: layout_tx,
            events: events.clone(),
            shutdown: shutdown_rx,
            socket: None,
            reconnect_at: None,
            attempts: 0,
            reloading: false,
            need_refresh: false,
            pending_layout: None,
            queue: VecDeque::new(),
        };
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            commands: commands_tx,
            state: state_rx,
            layout: layout_rx,
            events,
            shutdown_tx: Arc::new(shutdown_tx),
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        })
    }
}

/// Handle for observing and controlling a running session.
///
/// `Clone` is cheap. Dropping every handle stops the session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    layout: watch::Receiver<Option<Node>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    /// Taken and awaited exactly once by [`shutdown`](SessionHandle::shutdown).
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to session events from now on.
    ///
    /// Events sent before the call are not replayed; a fast bootstrap
    /// failure can emit `Failed` before the caller subscribes. Use
    /// [`watch_state`](Self::watch_state) as the reliable source for the
    /// lifecycle state.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Session events as a stream.
    pub fn event_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// The mounted layout tree, once mounted.
    pub fn layout(&self) -> Option<Node> {
        self.layout.borrow().clone()
    }

    /// Watch the mounted layout tree.
    pub fn watch_layout(&self) -> watch::Receiver<Option<Node>> {
        self.layout.clone()
    }

    /// Store of the mounted component `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionGone`] if the session has stopped.
    pub async fn store(&self, identity: &str) -> Result<Option<AspectStore>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Store {
                identity: identity.to_owned(),
                reply,
            })
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Unmount `identity` (and the components nested in its aspects).
    /// Returns whether it was mounted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SessionGone`] if the session has stopped.
    pub async fn unmount(&self, identity: &str) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Unmount {
                identity: identity.to_owned(),
                reply,
            })
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Stop the session, unmount everything and wait for the task to end.
    ///
    /// Calling `shutdown` more than once is safe; later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Join`] if the session task panicked.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| SessionError::Join(e.to_string())),
            None => Ok(()),
        }
    }
}

/// State owned by the session task.
struct Session {
    page_url: Url,
    config: SessionConfig,
    backend: Arc<dyn Backend>,
    connector: Arc<dyn Connector>,
    loader: RequirementLoader,
    storage: Arc<dyn WebStorage>,
    components: ComponentRegistry,
    registry: Registry,
    dispatcher: Dispatcher,
    page: String,
    /// Stylesheet requirement URLs, for asset-only reloads.
    stylesheets: Vec<String>,
    sink: UpdateSink,
    updates: mpsc::UnboundedReceiver<AspectUpdate>,
    calls_tx: mpsc::UnboundedSender<CallOutcome>,
    calls: mpsc::UnboundedReceiver<CallOutcome>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<SessionState>,
    layout: watch::Sender<Option<Node>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    socket: Option<Connection>,
    reconnect_at: Option<Instant>,
    /// Consecutive failed opens or unexpected closes.
    attempts: u32,
    /// A reload frame dropped the socket; the next open remounts.
    reloading: bool,
    /// The pending reload is a full refresh: the next open parks in
    /// `Refreshing` instead of remounting.
    need_refresh: bool,
    /// Bootstrap layout not mounted yet.
    pending_layout: Option<Value>,
    queue: VecDeque<Job>,
}

impl Session {
    async fn run(mut self) {
        let mut next = Next::Bootstrap;
        loop {
            next = match next {
                Next::Bootstrap => self.bootstrap().await,
                Next::Serve => self.serve().await,
                Next::Park => self.park().await,
                Next::Exit => break,
            };
        }
        self.socket = None;
        self.registry.clear();
        self.layout.send_replace(None);
        tracing::info!(page = %self.page, "session stopped");
    }

    async fn bootstrap(&mut self) -> Next {
        self.set_state(SessionState::Bootstrapping);
        let fetched = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return Next::Exit,
            result = self.backend.bootstrap() => result,
        };
        let Bootstrap {
            page,
            layout,
            bindings,
            ties,
            packages,
            requirements,
            reload,
        } = match fetched {
            Ok(bootstrap) => bootstrap,
            Err(e) => return self.fail(SessionError::from(e)),
        };

        self.dispatcher = Dispatcher::new(bindings.into_bindings(), ties);
        self.page = page;
        self.stylesheets = packages
            .values()
            .flat_map(|package| &package.requirements)
            .chain(&requirements)
            .filter(|requirement| requirement.kind == RequirementKind::Css)
            .map(|requirement| requirement.url.clone())
            .collect();
        tracing::info!(
            page = %self.page,
            bindings = self.dispatcher.binding_count(),
            ties = self.dispatcher.tie_count(),
            packages = packages.len(),
            "bootstrap complete"
        );

        self.set_state(SessionState::LoadingRequirements);
        let loaded = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return Next::Exit,
            result = self.loader.load_requirements(&requirements, &packages) => result,
        };
        if let Err(e) = loaded {
            tracing::error!(page = %self.page, error = %e, "requirement loading failed");
            let _ = self.events.send(SessionEvent::Failed(e.to_string()));
            return Next::Park;
        }
        for name in packages.keys() {
            if !self.components.has_package(name) {
                tracing::warn!(package = %name, "no components registered for package");
            }
        }

        self.pending_layout = Some(layout);
        if self.dispatcher.needs_socket() || reload {
            self.set_state(SessionState::Connecting);
            self.reconnect_at = Some(Instant::now());
            return Next::Serve;
        }
        tracing::info!(page = %self.page, "no websocket bindings, skipping socket");
        self.go_live(SessionState::Ready, SessionEvent::Ready)
            .unwrap_or(Next::Serve)
    }

    async fn serve(&mut self) -> Next {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Next::Exit,
                Some(command) = self.commands.recv() => self.on_command(command),
                () = sleep_until(reconnect_at) => {
                    if let Some(next) = self.try_connect().await {
                        return next;
                    }
                }
                frame = next_frame(&mut self.socket) => match frame {
                    Some(text) => {
                        if let Some(next) = self.on_frame(&text).await {
                            return next;
                        }
                    }
                    None => self.on_close(),
                },
                Some(update) = self.updates.recv() => self.on_update(update),
                Some(outcome) = self.calls.recv() => self.on_call(outcome),
            }
        }
    }

    /// Terminal states: keep answering handles and stores until shutdown.
    async fn park(&mut self) -> Next {
        self.socket = None;
        self.reconnect_at = None;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return Next::Exit,
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(update) = self.updates.recv() => {
                    let _ = update.done.send(());
                }
                Some(outcome) = self.calls.recv() => {
                    tracing::debug!(key = %outcome.key, "binding call finished after session parked");
                }
            }
        }
    }

    async fn try_connect(&mut self) -> Option<Next> {
        self.reconnect_at = None;
        let url = match socket_url(&self.page_url, &self.page) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = %e, "cannot derive websocket url");
                return self.give_up();
            }
        };
        let connect = self.connector.connect(&url);
        let result = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return Some(Next::Exit),
            result = connect => result,
        };
        match result {
            Ok(connection) => {
                tracing::info!(url = %url, "websocket connected");
                self.attempts = 0;
                self.socket = Some(connection);
                if self.reloading && self.need_refresh {
                    return Some(self.refresh());
                }
                if self.reloading {
                    return Some(self.remount());
                }
                if self.pending_layout.is_some() {
                    return self.go_live(SessionState::Ready, SessionEvent::Ready);
                }
                self.set_state(SessionState::Ready);
                let _ = self.events.send(SessionEvent::Ready);
                None
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, attempt = self.attempts + 1, "websocket connect failed");
                self.retry_or_give_up()
            }
        }
    }

    fn on_close(&mut self) {
        self.socket = None;
        tracing::warn!(page = %self.page, "websocket closed unexpectedly");
        self.set_state(SessionState::Connecting);
        // The layout was mounted when the socket first opened, so giving up
        // here never parks.
        let _ = self.retry_or_give_up();
    }

    fn retry_or_give_up(&mut self) -> Option<Next> {
        self.attempts += 1;
        if self.attempts > self.config.retries {
            return self.give_up();
        }
        tracing::info!(
            attempt = self.attempts,
            retries = self.config.retries,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "scheduling websocket reconnect"
        );
        self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
        None
    }

    fn give_up(&mut self) -> Option<Next> {
        tracing::error!(
            attempts = self.attempts,
            "websocket retries exhausted, giving up"
        );
        self.reconnect_at = None;
        self.reloading = false;
        self.need_refresh = false;
        self.go_live(SessionState::Disconnected, SessionEvent::ConnectionLost)
    }

    /// Mount any pending layout, then enter `state`. Returns `Some` if
    /// hydration failed and the session must park.
    fn go_live(&mut self, state: SessionState, event: SessionEvent) -> Option<Next> {
        if let Some(layout) = self.pending_layout.take()
            && let Err(e) = self.mount_layout(&layout)
        {
            return Some(self.fail(SessionError::from(e)));
        }
        self.set_state(state);
        let _ = self.events.send(event);
        None
    }

    fn remount(&mut self) -> Next {
        tracing::info!(page = %self.page, "reconnected after hot reload, remounting");
        let _ = self.events.send(SessionEvent::Remount);
        self.socket = None;
        self.registry.clear();
        self.queue.clear();
        self.layout.send_replace(None);
        self.dispatcher = Dispatcher::default();
        self.stylesheets.clear();
        self.pending_layout = None;
        self.reloading = false;
        self.attempts = 0;
        Next::Bootstrap
    }

    fn refresh(&mut self) -> Next {
        tracing::info!(page = %self.page, "server reachable again, requesting full refresh");
        self.socket = None;
        self.reloading = false;
        self.need_refresh = false;
        self.set_state(SessionState::Refreshing);
        let _ = self.events.send(SessionEvent::Refresh);
        Next::Park
    }

    fn fail(&mut self, error: SessionError) -> Next {
        tracing::error!(page = %self.page, error = %error, "session failed");
        self.set_state(SessionState::Failed);
        let _ = self.events.send(SessionEvent::Failed(error.to_string()));
        Next::Park
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "session state");
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Store { identity, reply } => {
                let _ = reply.send(self.registry.get(&identity).cloned());
            }
            Command::Unmount { identity, reply } => {
                let mounted = self.registry.contains(&identity);
                self.unmount_tree(&identity);
                let _ = reply.send(mounted);
            }
        }
    }

    fn on_update(&mut self, update: AspectUpdate) {
        if self.registry.contains(&update.identity) {
            self.queue.push_back(Job {
                identity: update.identity,
                changed: update.partial,
                initial: false,
            });
            self.drain();
        }
        let _ = update.done.send(());
    }

    fn on_call(&mut self, outcome: CallOutcome) {
        match outcome.result {
            Ok(response) => {
                for (identity, aspects) in response.output {
                    self.write_aspects(&identity, aspects);
                }
                self.drain();
            }
            Err(e) => tracing::warn!(key = %outcome.key, error = %e, "binding call failed"),
        }
    }

    async fn on_frame(&mut self, text: &str) -> Option<Next> {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "dropping frame");
                return None;
            }
        };
        match frame {
            ServerFrame::SetAspect {
                identity,
                regex,
                payload,
            } => self.on_set_aspect(identity, regex, payload),
            ServerFrame::GetAspect {
                identity,
                aspect,
                request_id,
            } => {
                let value = self
                    .registry
                    .get(&identity)
                    .and_then(|store| store.get_aspect(&aspect));
                let error = value.is_none().then(|| "Aspect not found".to_owned());
                if error.is_some() {
                    tracing::debug!(identity = %identity, aspect = %aspect, "get-aspect miss");
                }
                self.reply(ClientFrame::GetAspect {
                    request_id,
                    identity,
                    aspect,
                    value,
                    error,
                });
            }
            ServerFrame::SetStorage {
                identity,
                payload,
                storage,
            } => {
                if let Err(e) = self.storage.set_item(storage, &identity, payload.to_string()) {
                    tracing::warn!(key = %identity, ?storage, error = %e, "storage write failed");
                }
            }
            ServerFrame::GetStorage {
                identity,
                storage,
                request_id,
            } => {
                let value = self
                    .storage
                    .get_item(storage, &identity)
                    .map(|text| serde_json::from_str(&text).unwrap_or(Value::String(text)))
                    .unwrap_or(Value::Null);
                self.reply(ClientFrame::GetStorage {
                    request_id,
                    identity,
                    value,
                });
            }
            ServerFrame::Reload {
                filenames,
                deleted,
                hot,
                refresh,
            } => {
                if refresh || hot {
                    tracing::info!(page = %self.page, hot, refresh, "reload requested, closing socket");
                    self.reloading = true;
                    self.need_refresh = refresh;
                    self.set_state(SessionState::Reloading);
                    self.socket = None;
                    self.reconnect_at = Some(Instant::now() + self.config.reconnect_delay);
                    return None;
                }
                self.swap_assets(&filenames, &deleted).await;
            }
            ServerFrame::Ping {} => tracing::trace!("ping"),
        }
        None
    }

    fn on_set_aspect(&mut self, identity: Option<String>, regex: Option<String>, payload: Aspects) {
        let targets: Vec<String> = match (identity, regex) {
            (Some(identity), _) => vec![identity],
            (None, Some(pattern)) => match Regex::new(&pattern) {
                Ok(re) => self
                    .registry
                    .identities()
                    .filter(|identity| re.is_match(identity))
                    .map(str::to_owned)
                    .collect(),
                Err(source) => {
                    let e = ProtocolError::Pattern { pattern, source };
                    tracing::warn!(error = %e, "dropping set-aspect");
                    return;
                }
            },
            (None, None) => {
                tracing::warn!("dropping set-aspect without identity or regex");
                return;
            }
        };
        for identity in targets {
            self.write_aspects(&identity, payload.clone());
        }
        self.drain();
    }

    async fn swap_assets(&self, filenames: &[String], deleted: &[String]) {
        let named = |url: &str, names: &[String]| names.iter().any(|name| url.ends_with(name.as_str()));
        for url in &self.stylesheets {
            if named(url, deleted) {
                if let Err(e) = self.loader.host().remove_stylesheet(url).await {
                    tracing::warn!(url = %url, error = %e, "stylesheet removal failed");
                }
            } else if named(url, filenames) {
                match self.loader.load_requirement(&Requirement::css(url.clone())).await {
                    Ok(()) => tracing::info!(url = %url, "stylesheet reloaded"),
                    Err(e) => tracing::warn!(url = %url, error = %e, "stylesheet reload failed"),
                }
            }
        }
    }

    fn reply(&self, frame: ClientFrame) {
        let sent = self
            .socket
            .as_ref()
            .is_some_and(|socket| socket.send(frame.to_text()));
        if !sent {
            tracing::warn!("no open socket, dropping reply");
        }
    }

    fn mount_layout(&mut self, layout: &Value) -> Result<(), HydrateError> {
        let (node, fresh) = {
            let mut hydrator = Hydrator::new(&self.components, &self.registry, &self.sink);
            let node = hydrator.hydrate(layout)?;
            (node, hydrator.finish())
        };
        tracing::info!(page = %self.page, components = fresh.len(), "layout mounted");
        self.mount(fresh);
        self.layout.send_replace(Some(node));
        self.drain();
        Ok(())
    }

    /// Register freshly hydrated components and queue their initial
    /// dispatch, children first.
    fn mount(&mut self, fresh: Vec<Mounted>) {
        for mounted in fresh {
            let identity = mounted.store.identity().to_owned();
            let changed = mounted.store.aspects();
            self.registry.register(mounted);
            tracing::debug!(identity = %identity, "component mounted");
            self.queue.push_back(Job {
                identity,
                changed,
                initial: true,
            });
        }
    }

    fn unmount_tree(&mut self, identity: &str) {
        let Some(mounted) = self.registry.deregister(identity) else {
            return;
        };
        tracing::debug!(identity = %identity, "component unmounted");
        let mut nested = HashSet::new();
        for value in mounted.store.aspects().values() {
            component_identities(value, &mut nested);
        }
        for child in nested {
            self.unmount_tree(&child);
        }
    }

    /// Merge a server push, tie write or call output into `identity`.
    ///
    /// Components described in the new values are mounted, components that
    /// disappeared from the replaced values are unmounted, and a dispatch
    /// pass is queued.
    fn write_aspects(&mut self, identity: &str, partial: Aspects) {
        let Some(target) = self.registry.mounted(identity).cloned() else {
            tracing::debug!(identity = %identity, "write to unmounted component ignored");
            return;
        };

        let mut before = HashSet::new();
        let mut after = HashSet::new();
        for (name, value) in &partial {
            if let Some(old) = target.store.get_aspect(name) {
                component_identities(&old, &mut before);
            }
            component_identities(value, &mut after);
        }

        let fresh = {
            let mut hydrator = Hydrator::new(&self.components, &self.registry, &self.sink);
            for value in partial.values() {
                if let Err(e) = hydrator.hydrate(value) {
                    tracing::warn!(identity = %identity, error = %e, "dropping aspect write");
                    return;
                }
            }
            hydrator.finish()
        };

        let merged = target.store.merge(partial);
        if merged.is_empty() {
            return;
        }
        for gone in before.difference(&after) {
            self.unmount_tree(gone);
        }
        self.mount(fresh);

        let names: Vec<String> = merged.keys().cloned().collect();
        target.component.aspects_changed(&target.store, &names);
        self.queue.push_back(Job {
            identity: identity.to_owned(),
            changed: merged,
            initial: false,
        });
    }

    /// Run queued dispatch passes until the queue is empty.
    fn drain(&mut self) {
        let mut processed = 0;
        while let Some(job) = self.queue.pop_front() {
            if processed == self.config.max_cascade {
                tracing::warn!(
                    dropped = self.queue.len() + 1,
                    limit = self.config.max_cascade,
                    "dispatch cascade limit reached"
                );
                self.queue.clear();
                break;
            }
            processed += 1;
            if !self.registry.contains(&job.identity) {
                continue;
            }
            let actions = self.dispatcher.dispatch(
                &self.page,
                &job.identity,
                &job.changed,
                job.initial,
                &self.registry,
            );
            for action in actions {
                self.perform(action);
            }
        }
    }

    fn perform(&mut self, action: Action) {
        match action {
            Action::Send(message) => self.send_binding(message),
            Action::Call(message) => self.spawn_call(message),
            Action::Write { identity, aspects } => self.write_aspects(&identity, aspects),
        }
    }

    fn send_binding(&self, message: BindingMessage) {
        let key = message.key.clone();
        let sent = self
            .socket
            .as_ref()
            .is_some_and(|socket| socket.send(ClientFrame::Binding(message).to_text()));
        if sent {
            tracing::debug!(key = %key, "binding sent");
        } else {
            tracing::warn!(key = %key, "no open socket, dropping binding frame");
        }
    }

    fn spawn_call(&self, message: BindingMessage) {
        let backend = Arc::clone(&self.backend);
        let calls = self.calls_tx.clone();
        tokio::spawn(async move {
            let result = backend.call(&message).await;
            let _ = calls.send(CallOutcome {
                key: message.key,
                result,
            });
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_frame(socket: &mut Option<Connection>) -> Option<String> {
    match socket {
        Some(socket) => socket.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn bootstrap(&self) -> Result<Bootstrap, BackendError> {
            Err(BackendError::Status(503))
        }

        async fn call(&self, _message: &BindingMessage) -> Result<CallResponse, BackendError> {
            Err(BackendError::Status(503))
        }
    }

    #[test]
    fn spawn_rejects_relative_url() {
        let err = SessionBuilder::new("/not/absolute").spawn().unwrap_err();
        assert!(matches!(err, SessionError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn bootstrap_failure_parks_in_failed() {
        let session = SessionBuilder::new("http://localhost/page")
            .backend(Arc::new(FailingBackend))
            .spawn()
            .unwrap();
        let mut events = session.events();
        let mut state = session.watch_state();
        state
            .wait_for(|s| *s == SessionState::Failed)
            .await
            .expect("state channel open");
        let event = events.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Failed(reason) if reason.contains("503")));

        // Parked sessions still answer handles.
        assert!(session.store("anything").await.unwrap().is_none());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_reads_lifecycle_from_state() {
        let session = SessionBuilder::new("http://localhost/page")
            .backend(Arc::new(FailingBackend))
            .spawn()
            .unwrap();
        session
            .watch_state()
            .wait_for(|s| *s == SessionState::Failed)
            .await
            .expect("state channel open");

        let mut events = session.events();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(session.state(), SessionState::Failed);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_twice_returns_ok() {
        let session = SessionBuilder::new("http://localhost/page")
            .backend(Arc::new(FailingBackend))
            .spawn()
            .unwrap();
        session.shutdown().await.expect("first shutdown");
        session.shutdown().await.expect("second shutdown");
        assert!(matches!(
            session.store("x").await,
            Err(SessionError::SessionGone)
        ));
    }
}
