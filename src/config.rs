//! Tuning knobs for the protocol session.

use std::time::Duration;

/// Configuration for a protocol session.
///
/// Controls reconnection, handshake and asset timeouts, and the bound on
/// cascading tie writes. All fields have defaults accessible via
/// [`SessionConfig::default()`].
///
/// Pass to [`SessionBuilder::config`](crate::SessionBuilder::config) to
/// customize.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use aspect_sync::SessionConfig;
///
/// let config = SessionConfig {
///     retries: 2,
///     ..SessionConfig::default()
/// };
/// assert_eq!(config.retries, 2);
/// assert_eq!(config.reconnect_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How many times to retry opening the websocket after a failed open
    /// or an unexpected close.
    ///
    /// The counter resets on every successful open. With `retries: 2` the
    /// session makes at most three consecutive attempts, then parks in
    /// `Disconnected`.
    ///
    /// Default: 5.
    pub retries: u32,

    /// Fixed delay before each reconnection attempt.
    ///
    /// Default: 1 second.
    pub reconnect_delay: Duration,

    /// Upper bound on a single websocket handshake.
    ///
    /// Default: 10 seconds.
    pub connect_timeout: Duration,

    /// Upper bound on loading a single requirement.
    ///
    /// Default: 30 seconds.
    pub asset_timeout: Duration,

    /// Maximum dispatch jobs processed for one incoming event.
    ///
    /// Ties writing into each other in a cycle would otherwise never
    /// settle; the excess is dropped with a warning.
    ///
    /// Default: 1024.
    pub max_cascade: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            asset_timeout: Duration::from_secs(30),
            max_cascade: 1024,
        }
    }
}
