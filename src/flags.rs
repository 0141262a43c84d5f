//! Flag definitions as served by the definitions endpoint.
//!
//! Everything in this module is immutable once parsed. A new fetch replaces [`FlagDefinitions`]
//! wholesale.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::{rules::RuntimeRule, Result};

/// Context property used for assignment when a flag doesn't name one.
pub const DEFAULT_CONTEXT_PROPERTY: &str = "distinct_id";

/// Response format of the definitions endpoint.
#[derive(Debug, Deserialize)]
pub struct DefinitionsResponse {
    /// Flags configuration.
    ///
    /// Each flag is wrapped in `TryParse` so that if we fail to parse one flag (e.g., new server
    /// format), we can still serve other flags.
    pub flags: Vec<TryParse<Flag>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

/// A complete snapshot of all known flags, keyed by flag key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlagDefinitions {
    flags: HashMap<String, Flag>,
}

impl FlagDefinitions {
    /// Build a snapshot out of a parsed response, dropping flags that failed to parse.
    pub fn from_response(response: DefinitionsResponse) -> FlagDefinitions {
        let mut flags = HashMap::with_capacity(response.flags.len());
        for flag in response.flags {
            match flag {
                TryParse::Parsed(flag) => {
                    if let Some(previous) = flags.insert(flag.key.clone(), flag) {
                        log::warn!(target: "mixpanel",
                                   flag_key:display = previous.key;
                                   "duplicate flag key in definitions, keeping the last one");
                    }
                }
                TryParse::ParseFailed(raw) => {
                    let flag_key = raw.get("key").and_then(|key| key.as_str()).unwrap_or("");
                    log::warn!(target: "mixpanel",
                               flag_key;
                               "failed to parse flag definition, skipping it");
                }
            }
        }
        FlagDefinitions { flags }
    }

    /// Parse a definitions document.
    ///
    /// Fails only when the top-level document is malformed. Individual malformed flags are logged
    /// and skipped.
    pub fn from_slice(body: &[u8]) -> Result<FlagDefinitions> {
        let response: DefinitionsResponse = serde_json::from_slice(body)?;
        Ok(FlagDefinitions::from_response(response))
    }

    /// Create a snapshot from already-built flags.
    pub fn from_flags(flags: impl IntoIterator<Item = Flag>) -> FlagDefinitions {
        FlagDefinitions {
            flags: flags
                .into_iter()
                .map(|flag| (flag.key.clone(), flag))
                .collect(),
        }
    }

    /// Look up a flag by key.
    pub fn get(&self, flag_key: &str) -> Option<&Flag> {
        self.flags.get(flag_key)
    }

    /// All known flag keys, sorted.
    pub fn flag_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.flags.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

/// Serializes back into the wire format, so a snapshot can be stored and parsed again.
impl Serialize for FlagDefinitions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            flags: Vec<&'a Flag>,
        }

        let mut flags: Vec<&Flag> = self.flags.values().collect();
        flags.sort_unstable_by(|a, b| a.key.cmp(&b.key));
        Wire { flags }.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Flag {
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    pub key: String,
    #[serde(default, deserialize_with = "nullable")]
    pub status: String,
    #[serde(default, deserialize_with = "nullable")]
    pub project_id: u64,
    pub ruleset: RuleSet,
    /// Name of the context property whose value is hashed for assignment.
    #[serde(
        rename = "context",
        default = "default_context_property",
        deserialize_with = "context_property"
    )]
    pub context_property: String,
    #[serde(
        default,
        deserialize_with = "lenient_uuid",
        skip_serializing_if = "Option::is_none"
    )]
    pub experiment_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_experiment_active: Option<bool>,
    /// Enables per-flag salted hashing. Flags without a salt hash with the legacy literal salts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_salt: Option<String>,
}

impl Flag {
    /// Salt for the rollout at `rollout_index`.
    pub(crate) fn rollout_salt(&self, rollout_index: usize) -> String {
        match &self.hash_salt {
            Some(salt) => format!("{salt}{rollout_index}"),
            None => "rollout".to_owned(),
        }
    }

    /// Salt for variant split selection.
    pub(crate) fn variant_salt(&self) -> String {
        match &self.hash_salt {
            Some(salt) => format!("{salt}variant"),
            None => "variant".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct RuleSet {
    /// Sorted by key, so cumulative split selection doesn't depend on server ordering.
    #[serde(default, deserialize_with = "sorted_variants")]
    pub variants: Vec<Variant>,
    /// Evaluated in order, first match wins.
    #[serde(rename = "rollout", default, deserialize_with = "nullable")]
    pub rollouts: Vec<Rollout>,
    #[serde(
        rename = "test",
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "TestUsers::is_empty"
    )]
    pub test_users: TestUsers,
}

impl RuleSet {
    /// Look up a variant by key.
    pub fn variant(&self, key: &str) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.key == key)
    }
}

/// Variant overrides for QA testers, keyed by `distinct_id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct TestUsers {
    #[serde(default, deserialize_with = "nullable")]
    pub users: HashMap<String, String>,
}

impl TestUsers {
    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Variant {
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, deserialize_with = "nullable")]
    pub is_control: bool,
    /// Fraction of the traffic in `0..=1`.
    #[serde(default, deserialize_with = "nullable")]
    pub split: f64,
}

/// Forces a rollout to serve a single variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct VariantOverride {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RolloutWire", into = "RolloutWire")]
#[allow(missing_docs)]
pub struct Rollout {
    /// Fraction of subjects admitted by this rollout, in `0..=1`.
    pub rollout_percentage: f64,
    /// Takes precedence over `variant_splits`.
    pub variant_override: Option<VariantOverride>,
    /// Per-variant split weights replacing the flag-level ones for the variants named here.
    pub variant_splits: Option<HashMap<String, f64>>,
    pub runtime_rule: Option<RuntimeRule>,
}

/// On the wire, the two kinds of runtime rules live in separate fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RolloutWire {
    #[serde(default, deserialize_with = "nullable")]
    rollout_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant_override: Option<VariantOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant_splits: Option<HashMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtime_evaluation_definition: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runtime_evaluation_rule: Option<serde_json::Value>,
}

impl From<RolloutWire> for Rollout {
    fn from(wire: RolloutWire) -> Rollout {
        let legacy = wire
            .runtime_evaluation_definition
            .filter(|definition| !definition.is_empty());
        let declarative = wire
            .runtime_evaluation_rule
            .filter(|rule| !rule.is_null());

        let runtime_rule = match (legacy, declarative) {
            (Some(_), Some(rule)) => {
                log::warn!(target: "mixpanel",
                           "rollout declares both runtime_evaluation_definition and runtime_evaluation_rule, using runtime_evaluation_rule");
                Some(RuntimeRule::Declarative(rule))
            }
            (None, Some(rule)) => Some(RuntimeRule::Declarative(rule)),
            (Some(definition), None) => Some(RuntimeRule::Legacy(definition)),
            (None, None) => None,
        };

        Rollout {
            rollout_percentage: wire.rollout_percentage,
            variant_override: wire.variant_override,
            variant_splits: wire.variant_splits,
            runtime_rule,
        }
    }
}

impl From<Rollout> for RolloutWire {
    fn from(rollout: Rollout) -> RolloutWire {
        let (runtime_evaluation_definition, runtime_evaluation_rule) = match rollout.runtime_rule {
            Some(RuntimeRule::Legacy(definition)) => (Some(definition), None),
            Some(RuntimeRule::Declarative(rule)) => (None, Some(rule)),
            None => (None, None),
        };
        RolloutWire {
            rollout_percentage: rollout.rollout_percentage,
            variant_override: rollout.variant_override,
            variant_splits: rollout.variant_splits,
            runtime_evaluation_definition,
            runtime_evaluation_rule,
        }
    }
}

fn default_context_property() -> String {
    DEFAULT_CONTEXT_PROPERTY.to_owned()
}

/// Treat explicit `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn context_property<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|property| !property.is_empty())
        .unwrap_or_else(default_context_property))
}

fn sorted_variants<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<Variant>, D::Error> {
    let mut variants = Option::<Vec<Variant>>::deserialize(deserializer)?.unwrap_or_default();
    // Stable sort, so the first of duplicated keys survives `dedup_by`.
    variants.sort_by(|a, b| a.key.cmp(&b.key));
    let len = variants.len();
    variants.dedup_by(|a, b| a.key == b.key);
    if variants.len() != len {
        log::warn!(target: "mixpanel", "ruleset has duplicate variant keys, keeping the first one");
    }
    Ok(variants)
}

/// Malformed experiment ids are logged and treated as absent.
fn lenient_uuid<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Uuid>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) if s.is_empty() => None,
        Some(serde_json::Value::String(s)) => match Uuid::parse_str(&s) {
            Ok(id) => Some(id),
            Err(err) => {
                log::warn!(target: "mixpanel",
                           experiment_id:display = s,
                           error:display = err;
                           "invalid experiment_id, ignoring it");
                None
            }
        },
        Some(other) => {
            log::warn!(target: "mixpanel",
                       experiment_id:display = other;
                       "experiment_id is not a string, ignoring it");
            None
        }
    })
}
