//! Server settings.
//!
//! Immutable configuration created once before server start, using the
//! builder pattern for ergonomic construction.
//!
//! # Example
//!
//! ```rust
//! use moorage_server::ServerSettings;
//! use std::time::Duration;
//!
//! let settings = ServerSettings::builder()
//!     .host("127.0.0.1")
//!     .port(9000)
//!     .idle_timeout(Duration::from_secs(30))
//!     .build();
//!
//! assert_eq!(settings.addr(), "127.0.0.1:9000");
//! ```

use std::time::Duration;

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default per-connection idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 45;

/// Immutable server configuration.
///
/// Use [`ServerSettings::builder()`] to construct instances. Settings are
/// fixed at start time and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Host or address to bind (e.g. "0.0.0.0").
    host: String,

    /// Port to bind. Port 0 requests an ephemeral port; the bound address
    /// is observable through the server handle.
    port: u16,

    /// How long a connection may sit without its handler completing before
    /// its cancellation signal fires. Measured from connection open.
    idle_timeout: Duration,
}

impl ServerSettings {
    /// Creates a new settings builder.
    #[must_use]
    pub fn builder() -> ServerSettingsBuilder {
        ServerSettingsBuilder::default()
    }

    /// Returns the bind host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the bind port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the per-connection idle timeout.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Returns the `host:port` string passed to the listener bind call.
    ///
    /// An unresolvable host surfaces as a bind failure through the server
    /// handle, not as a construction error here.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`ServerSettings`].
#[derive(Debug, Clone)]
pub struct ServerSettingsBuilder {
    host: String,
    port: u16,
    idle_timeout: Duration,
}

impl ServerSettingsBuilder {
    /// Creates a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Sets the bind host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind port. Use 0 for an ephemeral port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the per-connection idle timeout.
    ///
    /// A zero duration fires the idle signal at the timer's next scheduling
    /// opportunity.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Builds the [`ServerSettings`] with the configured values.
    #[must_use]
    pub fn build(self) -> ServerSettings {
        ServerSettings {
            host: self.host,
            port: self.port,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Default for ServerSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = ServerSettings::default();

        assert_eq!(settings.host(), DEFAULT_HOST);
        assert_eq!(settings.port(), DEFAULT_PORT);
        assert_eq!(
            settings.idle_timeout(),
            Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_builder_chaining() {
        let settings = ServerSettings::builder()
            .host("127.0.0.1")
            .port(0)
            .idle_timeout(Duration::from_secs(1))
            .build();

        assert_eq!(settings.host(), "127.0.0.1");
        assert_eq!(settings.port(), 0);
        assert_eq!(settings.idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_addr_format() {
        let settings = ServerSettings::builder()
            .host("192.168.1.10")
            .port(9090)
            .build();

        assert_eq!(settings.addr(), "192.168.1.10:9090");
    }

    #[test]
    fn test_settings_clone() {
        let a = ServerSettings::builder().host("10.0.0.1").build();
        let b = a.clone();

        assert_eq!(a.host(), b.host());
        assert_eq!(a.idle_timeout(), b.idle_timeout());
    }
}
