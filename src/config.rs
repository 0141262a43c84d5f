use std::time::Duration;

use crate::{
    definitions_fetcher::DefinitionsFetcherConfig, exposure::NoopEventSender, EventSender,
    LocalFlagsProvider,
};

/// Configuration for [`LocalFlagsProvider`].
pub struct ClientConfig<'a> {
    pub(crate) project_token: String,
    pub(crate) api_host: String,
    pub(crate) request_timeout: Duration,
    pub(crate) enable_polling: bool,
    pub(crate) polling_interval: Duration,
    pub(crate) event_sender: Box<dyn EventSender + Send + Sync + 'a>,
}

impl<'a> ClientConfig<'a> {
    /// Default Mixpanel API host.
    pub const DEFAULT_API_HOST: &'static str = "api.mixpanel.com";
    /// Default timeout for a definitions request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default interval between definitions refreshes.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);

    /// Create a default configuration using the specified project token.
    ///
    /// ```
    /// # use mixpanel_flags::ClientConfig;
    /// ClientConfig::from_project_token("project-token");
    /// ```
    pub fn from_project_token(project_token: impl Into<String>) -> Self {
        ClientConfig {
            project_token: project_token.into(),
            api_host: ClientConfig::DEFAULT_API_HOST.to_owned(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            enable_polling: true,
            polling_interval: ClientConfig::DEFAULT_POLLING_INTERVAL,
            event_sender: Box::new(NoopEventSender),
        }
    }

    /// Override the API host. Accepts a bare host (`api-eu.mixpanel.com`) or a URL with an
    /// explicit scheme (`http://localhost:8080`).
    pub fn api_host(mut self, api_host: impl Into<String>) -> Self {
        self.api_host = api_host.into();
        self
    }

    /// Set the timeout for each definitions request.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Set the request timeout in whole seconds.
    pub fn request_timeout_seconds(self, seconds: u64) -> Self {
        self.request_timeout(Duration::from_secs(seconds))
    }

    /// Enable or disable background refresh of definitions. When disabled, definitions are
    /// fetched once by [`LocalFlagsProvider::start_polling_for_definitions`].
    pub fn enable_polling(mut self, enable_polling: bool) -> Self {
        self.enable_polling = enable_polling;
        self
    }

    /// Set the interval between background refreshes.
    ///
    /// A zero interval is ignored with a warning and the previous interval is kept.
    pub fn polling_interval(mut self, polling_interval: Duration) -> Self {
        if polling_interval.is_zero() {
            log::warn!(target: "mixpanel", polling_interval_ms = self.polling_interval.as_millis() as u64; "ignoring zero polling interval, keeping the current one");
            return self;
        }
        self.polling_interval = polling_interval;
        self
    }

    /// Set the interval between background refreshes in whole seconds.
    pub fn polling_interval_seconds(self, seconds: u64) -> Self {
        self.polling_interval(Duration::from_secs(seconds))
    }

    /// Set the event sender that receives exposure events.
    ///
    /// ```
    /// # use mixpanel_flags::ClientConfig;
    /// # use serde_json::{Map, Value};
    /// let config = ClientConfig::from_project_token("project-token").event_sender(
    ///     |distinct_id: &str, event_name: &str, properties: Map<String, Value>| {
    ///         println!("{distinct_id} {event_name} {properties:?}");
    ///     },
    /// );
    /// ```
    pub fn event_sender(mut self, event_sender: impl EventSender + Send + Sync + 'a) -> Self {
        self.event_sender = Box::new(event_sender);
        self
    }

    /// Create a new [`LocalFlagsProvider`] using the specified configuration.
    ///
    /// ```
    /// # use mixpanel_flags::{ClientConfig, LocalFlagsProvider};
    /// let provider: LocalFlagsProvider = ClientConfig::from_project_token("project-token").to_provider();
    /// ```
    pub fn to_provider(self) -> LocalFlagsProvider<'a> {
        LocalFlagsProvider::new(self)
    }

    pub(crate) fn fetcher_config(&self) -> DefinitionsFetcherConfig {
        DefinitionsFetcherConfig {
            api_host: self.api_host.clone(),
            project_token: self.project_token.clone(),
            request_timeout: self.request_timeout,
            lib_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ClientConfig;

    #[test]
    fn defaults() {
        let config = ClientConfig::from_project_token("token");
        assert_eq!(config.project_token, "token");
        assert_eq!(config.api_host, "api.mixpanel.com");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.enable_polling);
        assert_eq!(config.polling_interval, Duration::from_secs(60));
    }

    #[test]
    fn fetcher_config_carries_overrides() {
        let config = ClientConfig::from_project_token("token")
            .api_host("http://localhost:1234")
            .request_timeout(Duration::from_secs(2));
        let fetcher_config = config.fetcher_config();
        assert_eq!(fetcher_config.api_host, "http://localhost:1234");
        assert_eq!(fetcher_config.project_token, "token");
        assert_eq!(fetcher_config.request_timeout, Duration::from_secs(2));
        assert_eq!(fetcher_config.lib_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn second_based_setters() {
        let config = ClientConfig::from_project_token("token")
            .request_timeout_seconds(3)
            .polling_interval_seconds(120);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.polling_interval, Duration::from_secs(120));
    }

    #[test]
    fn zero_polling_interval_is_ignored() {
        let config = ClientConfig::from_project_token("token").polling_interval_seconds(0);
        assert_eq!(config.polling_interval, Duration::from_secs(60));

        let config = ClientConfig::from_project_token("token")
            .polling_interval(Duration::from_secs(5))
            .polling_interval(Duration::ZERO);
        assert_eq!(config.polling_interval, Duration::from_secs(5));
    }
}
