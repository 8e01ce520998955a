//! Crate-level error types for the protocol session and its collaborators.

/// A frame or piece of session metadata that could not be understood.
///
/// Protocol errors never end the session: the offending frame (or rule) is
/// logged and dropped, and processing continues with the next one.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON, or did not match the shape of its kind.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame carried no `kind` field.
    #[error("frame has no `kind` field")]
    MissingKind,

    /// The frame's `kind` is not one this client understands.
    #[error("unknown frame kind `{0}`")]
    UnknownKind(String),

    /// A regex-addressed trigger, state or target carried an invalid pattern.
    #[error("invalid pattern `{pattern}`: {source}")]
    Pattern {
        /// The pattern as sent by the server.
        pattern: String,
        /// The underlying compilation failure.
        source: regex::Error,
    },
}

/// Error returned when a script or stylesheet requirement fails to load.
///
/// Any single failure rejects the whole requirement-loading pass and keeps
/// the session from ever reaching `Ready`.
#[derive(Debug, thiserror::Error)]
pub enum AssetLoadError {
    /// The requirement's `kind` is not `js`, `css` or `map`.
    #[error("unknown requirement kind `{kind}` for {url}")]
    UnknownKind {
        /// Requirement URL.
        url: String,
        /// The kind string as received.
        kind: String,
    },

    /// The asset could not be fetched.
    #[error("failed to load {url}: {reason}")]
    Failed {
        /// Requirement URL.
        url: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The asset did not finish loading within the configured timeout.
    #[error("timed out loading {url}")]
    Timeout {
        /// Requirement URL.
        url: String,
    },
}

/// Error opening the websocket.
///
/// Handled by the reconnection policy; only surfaced once retries are
/// exhausted.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The socket URL could not be derived from the page URL.
    #[error("invalid socket url: {0}")]
    InvalidUrl(String),

    /// The websocket handshake failed.
    #[error("websocket connect failed: {0}")]
    Connect(String),

    /// The websocket handshake did not complete in time.
    #[error("websocket connect timed out")]
    Timeout,
}

/// Error talking to the page's HTTP endpoint (bootstrap or binding call).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The response body did not have the expected shape.
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Error turning a dry layout value into mounted components.
#[derive(Debug, thiserror::Error)]
pub enum HydrateError {
    /// No constructor is registered for `(package, component)`.
    #[error("no component `{component}` registered in package `{package}`")]
    UnknownComponent {
        /// Package name from the descriptor.
        package: String,
        /// Component name from the descriptor.
        component: String,
    },
}

/// Error returned by [`AspectStore::update_aspects`](crate::AspectStore::update_aspects).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store was unmounted and no longer takes part in dispatch.
    #[error("component `{0}` is no longer mounted")]
    Detached(String),

    /// The owning session has shut down.
    #[error("session is no longer running")]
    SessionGone,
}

/// Error returned by session-level operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The bootstrap HTTP call failed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BackendError),

    /// A requirement failed to load.
    #[error("requirement loading failed: {0}")]
    Assets(#[from] AssetLoadError),

    /// The bootstrap layout could not be hydrated.
    #[error("layout hydration failed: {0}")]
    Hydrate(#[from] HydrateError),

    /// The page URL is not a valid absolute URL.
    #[error("invalid page url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The session actor has exited.
    #[error("session is no longer running")]
    SessionGone,

    /// The session task panicked or was cancelled.
    #[error("session task failed: {0}")]
    Join(String),
}
