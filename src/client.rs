use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    definitions_fetcher::{DefinitionsFetcher, DefinitionsSource},
    definitions_store::DefinitionsStore,
    eval::subject_key,
    exposure::{send_exposure, ExposureEvent},
    flags::{FlagDefinitions, DEFAULT_CONTEXT_PROPERTY},
    poller::{PollerThread, PollerThreadConfig},
    sharder::Fnv1aSharder,
    ClientConfig, Result,
};

/// Evaluation context: `distinct_id`, any other identifiers flags assign on, and
/// `custom_properties` holding the runtime rule inputs as a JSON object.
pub type Context = HashMap<String, Value>;

/// Outcome of a flag evaluation.
///
/// A successful evaluation carries the variant key. A fallback supplied by the caller has no key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedVariant {
    /// Key of the selected variant. `None` for a fallback.
    pub variant_key: Option<String>,
    /// Value of the selected variant.
    pub variant_value: Value,
    /// Experiment the flag belongs to, if any.
    pub experiment_id: Option<Uuid>,
    /// Whether the experiment is active.
    pub is_experiment_active: Option<bool>,
    /// `true` if the variant was forced by a QA tester override.
    pub is_qa_tester: Option<bool>,
}

impl SelectedVariant {
    /// A fallback variant with `value` and no key.
    ///
    /// ```
    /// # use mixpanel_flags::SelectedVariant;
    /// let fallback = SelectedVariant::fallback("control");
    /// assert!(!fallback.is_success());
    /// ```
    pub fn fallback(value: impl Into<Value>) -> SelectedVariant {
        SelectedVariant {
            variant_key: None,
            variant_value: value.into(),
            experiment_id: None,
            is_experiment_active: None,
            is_qa_tester: None,
        }
    }

    /// `true` if the variant was selected by evaluation rather than being a fallback.
    pub fn is_success(&self) -> bool {
        self.variant_key.is_some()
    }
}

#[derive(Default)]
struct PollingState {
    source: Option<Arc<dyn DefinitionsSource>>,
    poller: Option<PollerThread>,
}

/// A flags provider that evaluates Mixpanel feature flags locally.
///
/// In order to create a provider instance, first create [`ClientConfig`]. Definitions are fetched
/// by [`LocalFlagsProvider::start_polling_for_definitions`]. Until that succeeds every evaluation
/// resolves to the caller's fallback.
///
/// # Examples
/// ```
/// # use mixpanel_flags::{ClientConfig, LocalFlagsProvider};
/// LocalFlagsProvider::new(ClientConfig::from_project_token("project-token"));
/// ```
pub struct LocalFlagsProvider<'a> {
    store: Arc<DefinitionsStore>,
    config: ClientConfig<'a>,
    polling: Mutex<PollingState>,
    closed: AtomicBool,
}

impl<'a> LocalFlagsProvider<'a> {
    /// Create a new `LocalFlagsProvider` fetching definitions from the Mixpanel API.
    pub fn new(config: ClientConfig<'a>) -> Self {
        LocalFlagsProvider {
            store: Arc::new(DefinitionsStore::new()),
            config,
            polling: Mutex::new(PollingState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a new `LocalFlagsProvider` fetching definitions from `source` instead of the
    /// Mixpanel API. The API settings of `config` are ignored.
    pub fn new_with_source(config: ClientConfig<'a>, source: Arc<dyn DefinitionsSource>) -> Self {
        LocalFlagsProvider {
            store: Arc::new(DefinitionsStore::new()),
            config,
            polling: Mutex::new(PollingState {
                source: Some(source),
                poller: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    fn new_with_definitions(config: ClientConfig<'a>, definitions: FlagDefinitions) -> Self {
        let provider = LocalFlagsProvider::new(config);
        provider.store.set_definitions(Arc::new(definitions));
        provider
    }

    /// Fetch definitions once, then keep refreshing them in the background if polling is
    /// enabled.
    ///
    /// The first fetch runs on the calling thread. If it fails the error is returned, the
    /// provider keeps serving fallbacks, and the background poller (when enabled) keeps
    /// retrying. Calling this again fetches once more but never starts a second poller. On a
    /// closed provider this does nothing.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::InvalidApiHost`] if the configured host isn't a valid URL.
    /// - Any fetch error from the first request.
    /// - [`crate::Error::Io`] if the poller thread fails to start.
    pub fn start_polling_for_definitions(&self) -> Result<()> {
        let mut polling = self.lock_polling();
        if self.closed.load(Ordering::SeqCst) {
            log::warn!(target: "mixpanel", "start_polling_for_definitions called on a closed provider, ignoring");
            return Ok(());
        }

        let source = match &polling.source {
            Some(source) => source.clone(),
            None => {
                let fetcher: Arc<dyn DefinitionsSource> =
                    Arc::new(DefinitionsFetcher::new(self.config.fetcher_config())?);
                polling.source = Some(fetcher.clone());
                fetcher
            }
        };

        let first_fetch = self.store.refresh_from(source.as_ref());

        if self.config.enable_polling && polling.poller.is_none() {
            log::debug!(target: "mixpanel",
                        interval_ms = self.config.polling_interval.as_millis() as u64;
                        "starting poller thread");
            let poller = PollerThread::start(
                source,
                self.store.clone(),
                PollerThreadConfig::new().with_interval(self.config.polling_interval),
            )?;
            polling.poller = Some(poller);
        }

        first_fetch
    }

    /// Stop background refresh, waiting a bounded time for the poller thread to exit. The
    /// current snapshot stays in use and polling may be started again.
    pub fn stop_polling_for_definitions(&self) {
        let poller = self.lock_polling().poller.take();
        if let Some(poller) = poller {
            log::debug!(target: "mixpanel", "stopping poller thread");
            if let Err(err) = poller.shutdown() {
                log::error!(target: "mixpanel", error:display = err; "poller thread failed");
            }
        }
    }

    /// Stop polling and mark the provider closed. Safe to call more than once.
    ///
    /// Evaluations keep using the last fetched snapshot.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!(target: "mixpanel", "closing flags provider");
        self.stop_polling_for_definitions();
    }

    /// `true` once flag definitions have been fetched successfully.
    pub fn are_flags_ready(&self) -> bool {
        self.store.is_ready()
    }

    /// Evaluate `flag_key` for `context`, returning `fallback` if the flag can't be evaluated.
    ///
    /// When `report_exposure` is `true` and a variant is selected, an exposure event is sent
    /// through the configured event sender.
    pub fn get_variant(
        &self,
        flag_key: &str,
        fallback: SelectedVariant,
        context: &Context,
        report_exposure: bool,
    ) -> SelectedVariant {
        let started = Instant::now();
        let Some(definitions) = self.store.get_definitions() else {
            log::warn!(target: "mixpanel", flag_key; "evaluating a flag before definitions have been fetched");
            return fallback;
        };

        match self.eval_flag(&definitions, flag_key, context) {
            Some(variant) => {
                if report_exposure {
                    self.report_exposure(flag_key, &variant, context, Some(started.elapsed()));
                }
                variant
            }
            None => fallback,
        }
    }

    /// Evaluate `flag_key` and deserialize the variant value into `T`.
    ///
    /// Returns `fallback_value` if the flag can't be evaluated or its value doesn't match `T`.
    /// Exposure is reported for selected variants.
    ///
    /// ```
    /// # use mixpanel_flags::{ClientConfig, Context};
    /// let provider = ClientConfig::from_project_token("project-token").to_provider();
    /// let steps: u32 = provider.get_variant_value("checkout-steps", 3, &Context::new());
    /// assert_eq!(steps, 3);
    /// ```
    pub fn get_variant_value<T: DeserializeOwned>(
        &self,
        flag_key: &str,
        fallback_value: T,
        context: &Context,
    ) -> T {
        let variant =
            self.get_variant(flag_key, SelectedVariant::fallback(Value::Null), context, true);
        if !variant.is_success() {
            return fallback_value;
        }

        match serde_json::from_value(variant.variant_value) {
            Ok(value) => value,
            Err(err) => {
                log::warn!(target: "mixpanel",
                           flag_key,
                           error:display = err;
                           "variant value has unexpected type, returning fallback");
                fallback_value
            }
        }
    }

    /// `true` only if `flag_key` resolves to the JSON boolean `true`.
    pub fn is_enabled(&self, flag_key: &str, context: &Context) -> bool {
        let variant = self.get_variant(flag_key, SelectedVariant::fallback(false), context, true);
        variant.variant_value == Value::Bool(true)
    }

    /// Evaluate every flag for `context`, sorted by flag key.
    ///
    /// Flags that can't be evaluated are omitted. All flags are evaluated against the same
    /// snapshot.
    pub fn get_all_variants(
        &self,
        context: &Context,
        report_exposure: bool,
    ) -> Vec<(String, SelectedVariant)> {
        let Some(definitions) = self.store.get_definitions() else {
            log::warn!(target: "mixpanel", "evaluating flags before definitions have been fetched");
            return Vec::new();
        };

        definitions
            .flag_keys()
            .into_iter()
            .filter_map(|flag_key| {
                let started = Instant::now();
                let variant = self.eval_flag(&definitions, flag_key, context)?;
                if report_exposure {
                    self.report_exposure(flag_key, &variant, context, Some(started.elapsed()));
                }
                Some((flag_key.to_owned(), variant))
            })
            .collect()
    }

    /// Report an exposure for a variant obtained earlier with `report_exposure = false`.
    ///
    /// Fallback variants are not reported.
    pub fn track_exposure_event(&self, flag_key: &str, variant: &SelectedVariant, context: &Context) {
        self.report_exposure(flag_key, variant, context, None);
    }

    fn eval_flag(
        &self,
        definitions: &FlagDefinitions,
        flag_key: &str,
        context: &Context,
    ) -> Option<SelectedVariant> {
        match definitions.eval_flag(flag_key, context, &Fnv1aSharder) {
            Ok(variant) => {
                log::trace!(target: "mixpanel",
                            flag_key,
                            context:serde = context,
                            variant:serde = variant;
                            "evaluated a flag");
                Some(variant)
            }
            Err(failure) if failure.is_anomaly() => {
                log::warn!(target: "mixpanel",
                           flag_key,
                           error:display = failure;
                           "flag evaluation failed, returning fallback");
                None
            }
            Err(failure) => {
                log::trace!(target: "mixpanel",
                            flag_key,
                            reason:display = failure;
                            "flag did not select a variant");
                None
            }
        }
    }

    fn report_exposure(
        &self,
        flag_key: &str,
        variant: &SelectedVariant,
        context: &Context,
        latency: Option<Duration>,
    ) {
        let Some(variant_key) = &variant.variant_key else {
            return;
        };
        let Some(distinct_id) = context.get(DEFAULT_CONTEXT_PROPERTY).and_then(subject_key) else {
            log::warn!(target: "mixpanel", flag_key; "cannot report exposure without distinct_id in context");
            return;
        };

        let event = ExposureEvent {
            flag_key: flag_key.to_owned(),
            variant_key: variant_key.clone(),
            experiment_type: "feature_flag",
            evaluation_mode: "local",
            latency_ms: latency.map(|latency| latency.as_secs_f64() * 1000.0),
            experiment_id: variant.experiment_id,
            is_experiment_active: variant.is_experiment_active,
            is_qa_tester: variant.is_qa_tester,
            time: Utc::now(),
        };
        send_exposure(self.config.event_sender.as_ref(), &distinct_id, &event);
    }

    fn lock_polling(&self) -> MutexGuard<'_, PollingState> {
        match self.polling.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for LocalFlagsProvider<'_> {
    fn drop(&mut self) {
        // Signal the poller without waiting. It exits after its current fetch, if any.
        if let Some(poller) = self.lock_polling().poller.take() {
            poller.stop();
        }
    }
}
