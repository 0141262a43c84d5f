//! An HTTP client that fetches flag definitions from the server.
use std::time::Duration;

use rand::{thread_rng, Rng};
use reqwest::{header::CONTENT_TYPE, StatusCode, Url};

use crate::{flags::FlagDefinitions, Error, Result};

const DEFINITIONS_ENDPOINT: &str = "/flags/definitions";

/// A source of flag definitions.
///
/// Closures returning `Result<FlagDefinitions>` implement this trait, which is handy for tests
/// and for serving definitions from somewhere other than the Mixpanel API.
pub trait DefinitionsSource: Send + Sync {
    /// Fetch the complete current set of flag definitions.
    fn fetch_definitions(&self) -> Result<FlagDefinitions>;
}

impl<F: Fn() -> Result<FlagDefinitions> + Send + Sync> DefinitionsSource for F {
    fn fetch_definitions(&self) -> Result<FlagDefinitions> {
        self()
    }
}

/// Configuration for [`DefinitionsFetcher`].
#[derive(Debug, Clone)]
pub struct DefinitionsFetcherConfig {
    /// Mixpanel API host. A bare host name is accessed over https.
    pub api_host: String,
    /// Project token, sent as the basic auth user name.
    pub project_token: String,
    /// Timeout applied to each request.
    pub request_timeout: Duration,
    /// Version of the library, reported in the `lib_version` query parameter.
    pub lib_version: String,
}

/// A client that fetches flag definitions from the Mixpanel API.
pub struct DefinitionsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    project_token: String,
}

impl DefinitionsFetcher {
    /// Create a new fetcher.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidApiHost`] if `api_host` doesn't form a valid URL.
    /// - [`Error::Network`] if the HTTP client cannot be initialized.
    pub fn new(config: DefinitionsFetcherConfig) -> Result<DefinitionsFetcher> {
        let url = definitions_url(&config.api_host, &config.project_token, &config.lib_version)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(DefinitionsFetcher {
            client,
            url,
            project_token: config.project_token,
        })
    }
}

impl DefinitionsSource for DefinitionsFetcher {
    fn fetch_definitions(&self) -> Result<FlagDefinitions> {
        log::debug!(target: "mixpanel", "fetching flag definitions");
        let response = self
            .client
            .get(self.url.clone())
            .basic_auth(&self.project_token, Some(""))
            .header("X-Scheme", "https")
            .header("X-Forwarded-Proto", "https")
            .header(CONTENT_TYPE, "application/json")
            .header("traceparent", traceparent())
            .send()?;

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "mixpanel", "client is not authorized. Check your project token");
                return Err(Error::Unauthorized);
            }
            status if !status.is_success() => {
                log::warn!(target: "mixpanel", status = status.as_u16(); "received non-success response while fetching flag definitions");
                return Err(Error::HttpStatus(status.as_u16()));
            }
            _ => {}
        }

        let body = response.bytes()?;
        let definitions = FlagDefinitions::from_slice(&body)?;

        log::debug!(target: "mixpanel", flags = definitions.len(); "successfully fetched flag definitions");

        Ok(definitions)
    }
}

/// Build the definitions endpoint URL for `api_host`.
///
/// `api_host` may be a bare host (`api.mixpanel.com`) or include an explicit scheme, which is
/// kept as is.
pub(crate) fn definitions_url(api_host: &str, project_token: &str, lib_version: &str) -> Result<Url> {
    let api_host = api_host.trim_end_matches('/');
    let base = if api_host.starts_with("http://") || api_host.starts_with("https://") {
        api_host.to_owned()
    } else {
        format!("https://{api_host}")
    };

    Url::parse_with_params(
        &format!("{base}{DEFINITIONS_ENDPOINT}"),
        &[
            ("mp_lib", "rust"),
            ("lib_version", lib_version),
            ("token", project_token),
        ],
    )
    .map_err(Error::InvalidApiHost)
}

/// W3C trace context header for a fresh, sampled trace.
fn traceparent() -> String {
    let mut rng = thread_rng();
    let trace_id: u128 = rng.gen();
    let span_id: u64 = rng.gen();
    format!("00-{trace_id:032x}-{span_id:016x}-01")
}
