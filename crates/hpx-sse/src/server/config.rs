//! Stream session configuration.

use std::{fmt, sync::Arc, time::Duration};

/// Finalizer shared by every session created from one configuration.
pub type DefaultCleanup = Arc<dyn Fn() + Send + Sync>;

/// Configuration for server-side stream sessions.
///
/// Follows the same builder pattern as the client-side
/// [`SubscriptionConfig`](crate::client::SubscriptionConfig).
#[derive(Clone)]
pub struct SessionConfig {
    /// Id carried by the first frame of a session.
    pub initial_message_id: u64,
    /// Number a resumed session's frames from one past the client's last
    /// numeric event id instead of `initial_message_id`.
    pub continue_ids: bool,
    /// Reconnect delay advised to clients with a leading `retry:` frame.
    pub retry: Option<Duration>,
    /// Interval between keep-alive comment frames (None = disabled).
    pub keep_alive: Option<Duration>,
    /// Cleanup run when a session closes and neither the handler nor its
    /// return value registered one.
    pub default_cleanup: Option<DefaultCleanup>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_message_id: 0,
            continue_ids: false,
            retry: None,
            keep_alive: Some(Duration::from_secs(15)),
            default_cleanup: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("initial_message_id", &self.initial_message_id)
            .field("continue_ids", &self.continue_ids)
            .field("retry", &self.retry)
            .field("keep_alive", &self.keep_alive)
            .field("default_cleanup", &self.default_cleanup.is_some())
            .finish()
    }
}

impl SessionConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the id of the first frame.
    #[must_use]
    pub fn initial_message_id(mut self, id: u64) -> Self {
        self.initial_message_id = id;
        self
    }

    /// Continue frame ids across reconnects (see
    /// [`ResumeInfo::resume_from`](super::ResumeInfo::resume_from)).
    #[must_use]
    pub fn continue_ids(mut self, enabled: bool) -> Self {
        self.continue_ids = enabled;
        self
    }

    /// Advise clients to wait `delay` before reconnecting.
    #[must_use]
    pub fn retry(mut self, delay: Duration) -> Self {
        self.retry = Some(delay);
        self
    }

    /// Set the keep-alive interval (None disables keep-alive frames).
    #[must_use]
    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set a cleanup that runs when any session closes, unless the handler
    /// registered its own first.
    #[must_use]
    pub fn default_cleanup(mut self, cleanup: impl Fn() + Send + Sync + 'static) -> Self {
        self.default_cleanup = Some(Arc::new(cleanup));
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.keep_alive.is_some_and(|interval| interval.is_zero()) {
            return Err("Keep-alive interval must be > 0".to_string());
        }
        if self.retry.is_some_and(|delay| delay.is_zero()) {
            return Err("Retry advisory must be > 0".to_string());
        }
        Ok(())
    }
}
