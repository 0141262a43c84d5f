//! Exposure events record that a subject was served a variant.
use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Name of the exposure event.
pub const EXPOSURE_EVENT_NAME: &str = "$experiment_started";

/// Properties of an exposure event, as sent to Mixpanel.
#[derive(Debug, Clone, Serialize)]
#[allow(missing_docs)]
pub struct ExposureEvent {
    #[serde(rename = "Experiment name")]
    pub flag_key: String,
    #[serde(rename = "Variant name")]
    pub variant_key: String,
    #[serde(rename = "$experiment_type")]
    pub experiment_type: &'static str,
    #[serde(rename = "Flag evaluation mode")]
    pub evaluation_mode: &'static str,
    /// Time spent evaluating the flag. Absent for manually reported exposures.
    #[serde(
        rename = "Variant fetch latency (ms)",
        skip_serializing_if = "Option::is_none"
    )]
    pub latency_ms: Option<f64>,
    #[serde(rename = "$experiment_id", skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<Uuid>,
    #[serde(
        rename = "$is_experiment_active",
        skip_serializing_if = "Option::is_none"
    )]
    pub is_experiment_active: Option<bool>,
    #[serde(rename = "$is_qa_tester", skip_serializing_if = "Option::is_none")]
    pub is_qa_tester: Option<bool>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
}

impl ExposureEvent {
    /// Event properties as a JSON object.
    pub fn to_properties(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(properties)) => properties,
            // ExposureEvent always serializes into an object.
            _ => Map::new(),
        }
    }
}

/// Sends analytics events on behalf of the flags provider.
///
/// Implementations should not block for long: exposure events are sent on the thread that
/// evaluates the flag.
pub trait EventSender {
    /// Send `event_name` with `properties` for `distinct_id`. Delivery is fire-and-forget.
    fn send_event(&self, distinct_id: &str, event_name: &str, properties: Map<String, Value>);
}

pub(crate) struct NoopEventSender;

impl EventSender for NoopEventSender {
    fn send_event(&self, _distinct_id: &str, _event_name: &str, _properties: Map<String, Value>) {}
}

impl<T: Fn(&str, &str, Map<String, Value>)> EventSender for T {
    fn send_event(&self, distinct_id: &str, event_name: &str, properties: Map<String, Value>) {
        self(distinct_id, event_name, properties);
    }
}

/// Hand `event` to `sender`. A panicking sender is logged and otherwise ignored.
pub(crate) fn send_exposure(
    sender: &(dyn EventSender + Send + Sync + '_),
    distinct_id: &str,
    event: &ExposureEvent,
) {
    let properties = event.to_properties();
    log::trace!(target: "mixpanel",
                distinct_id = distinct_id,
                flag_key:display = event.flag_key,
                variant_key:display = event.variant_key;
                "sending exposure event");

    let result = catch_unwind(AssertUnwindSafe(|| {
        sender.send_event(distinct_id, EXPOSURE_EVENT_NAME, properties)
    }));
    if result.is_err() {
        log::error!(target: "mixpanel",
                    flag_key:display = event.flag_key;
                    "event sender panicked while sending an exposure event");
    }
}
