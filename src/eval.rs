use serde_json::Value;

use crate::{
    client::{Context, SelectedVariant},
    error::EvaluationFailure,
    flags::{Flag, FlagDefinitions, Rollout, Variant, DEFAULT_CONTEXT_PROPERTY},
    rules::to_js_string,
    sharder::Sharder,
};

/// Context property holding the runtime rule inputs.
pub const CUSTOM_PROPERTIES: &str = "custom_properties";

impl FlagDefinitions {
    /// Evaluate the flag named `flag_key` for `context`.
    pub fn eval_flag(
        &self,
        flag_key: &str,
        context: &Context,
        sharder: &impl Sharder,
    ) -> Result<SelectedVariant, EvaluationFailure> {
        let flag = self.get(flag_key).ok_or(EvaluationFailure::FlagNotFound)?;
        flag.eval(context, sharder)
    }
}

impl Flag {
    /// Evaluate this flag for `context`.
    ///
    /// QA tester overrides are checked first, then rollouts in order. The first rollout that
    /// admits the subject decides the variant, even if that variant can't be resolved.
    pub fn eval(
        &self,
        context: &Context,
        sharder: &impl Sharder,
    ) -> Result<SelectedVariant, EvaluationFailure> {
        let subject_key = context
            .get(&self.context_property)
            .and_then(subject_key)
            .ok_or_else(|| {
                EvaluationFailure::ContextPropertyMissing(self.context_property.clone())
            })?;

        if let Some(variant) = self.get_test_user_variant(context) {
            return Ok(self.to_selected_variant(variant, true));
        }

        let hash_key = format!("{}{}", subject_key, self.key);
        let custom_properties = context.get(CUSTOM_PROPERTIES).and_then(Value::as_object);

        for (rollout_index, rollout) in self.ruleset.rollouts.iter().enumerate() {
            let rollout_hash = sharder.normalized_hash(&hash_key, &self.rollout_salt(rollout_index));
            if rollout_hash >= rollout.rollout_percentage {
                continue;
            }

            if let Some(rule) = &rollout.runtime_rule {
                let satisfied = rule
                    .eval(custom_properties)
                    .map_err(EvaluationFailure::RuleError)?;
                if !satisfied {
                    continue;
                }
            }

            let variant = self.get_rollout_variant(rollout, &hash_key, sharder)?;
            return Ok(self.to_selected_variant(variant, false));
        }

        Err(EvaluationFailure::NoRolloutMatched)
    }

    /// Test users are always looked up by `distinct_id`, whatever the flag's context property is.
    fn get_test_user_variant(&self, context: &Context) -> Option<&Variant> {
        let test_users = &self.ruleset.test_users;
        if test_users.is_empty() {
            return None;
        }

        let distinct_id = context.get(DEFAULT_CONTEXT_PROPERTY).and_then(subject_key)?;
        let variant_key = test_users.users.get(&distinct_id)?;
        let variant = self.ruleset.variant(variant_key);
        if variant.is_none() {
            log::warn!(target: "mixpanel",
                       flag_key:display = self.key,
                       distinct_id:display = distinct_id,
                       variant_key:display = variant_key;
                       "test user override names an unknown variant, ignoring it");
        }
        variant
    }

    fn get_rollout_variant(
        &self,
        rollout: &Rollout,
        hash_key: &str,
        sharder: &impl Sharder,
    ) -> Result<&Variant, EvaluationFailure> {
        if let Some(variant_override) = &rollout.variant_override {
            return self
                .ruleset
                .variant(&variant_override.key)
                .ok_or_else(|| EvaluationFailure::VariantNotFound(variant_override.key.clone()));
        }

        let variant_hash = sharder.normalized_hash(hash_key, &self.variant_salt());

        let mut cumulative = 0.0;
        for variant in &self.ruleset.variants {
            let split = rollout
                .variant_splits
                .as_ref()
                .and_then(|splits| splits.get(&variant.key))
                .copied()
                .unwrap_or(variant.split);
            cumulative += split.max(0.0);
            if variant_hash < cumulative {
                return Ok(variant);
            }
        }

        // Splits that don't add up to 1.0 leave the tail to the last variant.
        self.ruleset
            .variants
            .last()
            .ok_or(EvaluationFailure::NoVariants)
    }

    fn to_selected_variant(&self, variant: &Variant, is_qa_tester: bool) -> SelectedVariant {
        SelectedVariant {
            variant_key: Some(variant.key.clone()),
            variant_value: variant.value.clone(),
            experiment_id: self.experiment_id,
            is_experiment_active: self.is_experiment_active,
            is_qa_tester: Some(is_qa_tester),
        }
    }
}

/// String form of a context value used for hashing. `null` counts as absent.
pub(crate) fn subject_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(to_js_string(value)),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use proptest::prelude::*;
    use serde_json::{json, Value};

    use crate::{
        client::Context,
        error::EvaluationFailure,
        flags::{Flag, FlagDefinitions, Rollout, RuleSet, TestUsers, Variant, VariantOverride},
        rules::{RuleError, RuntimeRule},
        sharder::{DeterministicSharder, Fnv1aSharder},
    };

    fn variant(key: &str, split: f64) -> Variant {
        Variant {
            key: key.to_owned(),
            value: json!(key),
            is_control: false,
            split,
        }
    }

    fn rollout(rollout_percentage: f64) -> Rollout {
        Rollout {
            rollout_percentage,
            variant_override: None,
            variant_splits: None,
            runtime_rule: None,
        }
    }

    fn flag(key: &str, variants: Vec<Variant>, rollouts: Vec<Rollout>) -> Flag {
        Flag {
            id: format!("{key}-id"),
            name: key.to_owned(),
            key: key.to_owned(),
            status: "active".to_owned(),
            project_id: 1,
            ruleset: RuleSet {
                variants,
                rollouts,
                test_users: TestUsers::default(),
            },
            context_property: "distinct_id".to_owned(),
            experiment_id: None,
            is_experiment_active: None,
            hash_salt: None,
        }
    }

    fn context(distinct_id: &str) -> Context {
        HashMap::from([("distinct_id".to_owned(), json!(distinct_id))])
    }

    fn abc_flag() -> Flag {
        flag(
            "flag",
            vec![variant("A", 0.34), variant("B", 0.33), variant("C", 0.33)],
            vec![rollout(1.0)],
        )
    }

    #[test]
    fn unknown_flag() {
        let definitions = FlagDefinitions::from_flags([abc_flag()]);
        assert_eq!(
            definitions.eval_flag("other", &context("user"), &Fnv1aSharder),
            Err(EvaluationFailure::FlagNotFound)
        );
    }

    #[test]
    fn missing_context_property() {
        let mut flag = abc_flag();
        flag.context_property = "device_id".to_owned();

        assert_eq!(
            flag.eval(&context("user"), &Fnv1aSharder),
            Err(EvaluationFailure::ContextPropertyMissing("device_id".to_owned()))
        );

        let null_device: Context = HashMap::from([("device_id".to_owned(), Value::Null)]);
        assert!(flag.eval(&null_device, &Fnv1aSharder).is_err());
    }

    #[test]
    fn numeric_context_values_are_stringified() {
        let flag = abc_flag();
        let numeric: Context = HashMap::from([("distinct_id".to_owned(), json!(42))]);
        assert_eq!(
            flag.eval(&numeric, &Fnv1aSharder),
            flag.eval(&context("42"), &Fnv1aSharder)
        );
    }

    #[test]
    fn zero_rollout_never_matches() {
        let flag = flag("flag", vec![variant("on", 1.0)], vec![rollout(0.0)]);
        for i in 0..200 {
            assert_eq!(
                flag.eval(&context(&format!("user-{i}")), &Fnv1aSharder),
                Err(EvaluationFailure::NoRolloutMatched)
            );
        }
    }

    #[test]
    fn empty_ruleset_has_no_variants() {
        let flag = flag("flag", vec![], vec![rollout(1.0)]);
        assert_eq!(
            flag.eval(&context("user"), &Fnv1aSharder),
            Err(EvaluationFailure::NoVariants)
        );
    }

    #[test]
    fn test_user_override_wins() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts = vec![rollout(0.0)];
        flag.ruleset.test_users.users = HashMap::from([("qa".to_owned(), "B".to_owned())]);

        let result = flag.eval(&context("qa"), &Fnv1aSharder).unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("B"));
        assert_eq!(result.is_qa_tester, Some(true));
    }

    #[test]
    fn test_user_override_uses_distinct_id() {
        let mut flag = abc_flag();
        flag.context_property = "device_id".to_owned();
        flag.ruleset.test_users.users = HashMap::from([("qa".to_owned(), "C".to_owned())]);

        let ctx: Context = HashMap::from([
            ("distinct_id".to_owned(), json!("qa")),
            ("device_id".to_owned(), json!("device-1")),
        ]);
        let result = flag.eval(&ctx, &Fnv1aSharder).unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("C"));
        assert_eq!(result.is_qa_tester, Some(true));
    }

    #[test]
    fn test_user_override_to_unknown_variant_falls_through() {
        let mut flag = abc_flag();
        flag.ruleset.test_users.users = HashMap::from([("qa".to_owned(), "Z".to_owned())]);

        let result = flag.eval(&context("qa"), &Fnv1aSharder).unwrap();
        assert!(result.is_success());
        assert_eq!(result.is_qa_tester, Some(false));
    }

    #[test]
    fn variant_splits_override_flag_splits() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts[0].variant_splits = Some(HashMap::from([
            ("A".to_owned(), 0.0),
            ("B".to_owned(), 0.0),
            ("C".to_owned(), 1.0),
        ]));

        for i in 0..1000 {
            let result = flag
                .eval(&context(&format!("user-{i}")), &Fnv1aSharder)
                .unwrap();
            assert_eq!(result.variant_key.as_deref(), Some("C"));
        }
    }

    #[test]
    fn partial_variant_splits_keep_flag_splits_for_unlisted_variants() {
        let mut flag = flag(
            "flag",
            vec![variant("A", 0.3), variant("B", 0.3), variant("C", 0.4)],
            vec![rollout(1.0)],
        );
        // Only A is overridden. B and C keep 0.3 and 0.4, so B covers [0.0, 0.3).
        flag.ruleset.rollouts[0].variant_splits =
            Some(HashMap::from([("A".to_owned(), 0.0)]));

        for (hash, expected) in [(0.0, "B"), (0.2, "B"), (0.29, "B"), (0.5, "C"), (0.65, "C")] {
            let sharder =
                DeterministicSharder(HashMap::from([("userflagvariant".to_owned(), hash)]));
            assert_eq!(
                flag.eval(&context("user"), &sharder).unwrap().variant_key.as_deref(),
                Some(expected),
                "hash {hash}"
            );
        }
    }

    #[test]
    fn variant_override_beats_variant_splits() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts[0].variant_splits = Some(HashMap::from([("C".to_owned(), 1.0)]));
        flag.ruleset.rollouts[0].variant_override = Some(VariantOverride {
            key: "A".to_owned(),
        });

        for i in 0..100 {
            let result = flag
                .eval(&context(&format!("user-{i}")), &Fnv1aSharder)
                .unwrap();
            assert_eq!(result.variant_key.as_deref(), Some("A"));
        }
    }

    #[test]
    fn unresolvable_variant_override_is_terminal() {
        let mut flag = abc_flag();
        let mut broken = rollout(1.0);
        broken.variant_override = Some(VariantOverride {
            key: "missing".to_owned(),
        });
        flag.ruleset.rollouts = vec![broken, rollout(1.0)];

        assert_eq!(
            flag.eval(&context("user"), &Fnv1aSharder),
            Err(EvaluationFailure::VariantNotFound("missing".to_owned()))
        );
    }

    #[test]
    fn first_matching_rollout_wins() {
        let mut flag = abc_flag();
        let mut first = rollout(0.5);
        first.variant_override = Some(VariantOverride {
            key: "A".to_owned(),
        });
        let mut second = rollout(1.0);
        second.variant_override = Some(VariantOverride {
            key: "B".to_owned(),
        });
        flag.ruleset.rollouts = vec![first, second];

        let sharder = DeterministicSharder(HashMap::from([
            ("userflagrollout".to_owned(), 0.7),
        ]));
        assert_eq!(
            flag.eval(&context("user"), &sharder).unwrap().variant_key.as_deref(),
            Some("B")
        );

        let sharder = DeterministicSharder(HashMap::from([
            ("userflagrollout".to_owned(), 0.2),
        ]));
        assert_eq!(
            flag.eval(&context("user"), &sharder).unwrap().variant_key.as_deref(),
            Some("A")
        );
    }

    #[test]
    fn salted_flags_hash_with_index_and_variant_suffix() {
        let mut flag = abc_flag();
        flag.hash_salt = Some("s4lt".to_owned());
        flag.ruleset.rollouts = vec![rollout(0.5), rollout(0.5)];

        let sharder = DeterministicSharder(HashMap::from([
            ("userflags4lt0".to_owned(), 0.9),
            ("userflags4lt1".to_owned(), 0.1),
            ("userflags4ltvariant".to_owned(), 0.5),
        ]));
        let result = flag.eval(&context("user"), &sharder).unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("B"));

        let sharder = DeterministicSharder(HashMap::from([
            ("userflags4lt0".to_owned(), 0.9),
            ("userflags4lt1".to_owned(), 0.9),
        ]));
        assert_eq!(
            flag.eval(&context("user"), &sharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );
    }

    #[test]
    fn unsalted_flags_hash_with_literal_salts() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts = vec![rollout(0.5)];

        let sharder = DeterministicSharder(HashMap::from([
            ("userflagrollout".to_owned(), 0.4),
            ("userflagvariant".to_owned(), 0.99),
        ]));
        let result = flag.eval(&context("user"), &sharder).unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("C"));
    }

    #[test]
    fn split_remainder_goes_to_last_variant() {
        let flag = flag(
            "flag",
            vec![variant("a", 0.2), variant("b", 0.2), variant("c", -1.0)],
            vec![rollout(1.0)],
        );
        let sharder = DeterministicSharder(HashMap::from([(
            "userflagvariant".to_owned(),
            0.9,
        )]));
        assert_eq!(
            flag.eval(&context("user"), &sharder).unwrap().variant_key.as_deref(),
            Some("c")
        );
    }

    #[test]
    fn legacy_rule_gates_rollout() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts[0].runtime_rule = Some(RuntimeRule::Legacy(HashMap::from([(
            "plan".to_owned(),
            json!("premium"),
        )])));

        assert_eq!(
            flag.eval(&context("user"), &Fnv1aSharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );

        let mut ctx = context("user");
        ctx.insert("custom_properties".to_owned(), json!({"plan": "Premium"}));
        assert!(flag.eval(&ctx, &Fnv1aSharder).is_ok());

        ctx.insert("custom_properties".to_owned(), json!({"plan": "free"}));
        assert_eq!(
            flag.eval(&ctx, &Fnv1aSharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );
    }

    #[test]
    fn declarative_rule_gates_rollout() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts[0].runtime_rule = Some(RuntimeRule::Declarative(json!({
            "and": [
                {"==": [{"var": "plan"}, "premium"]},
                {">=": [{"var": "seats"}, 10]}
            ]
        })));

        let mut ctx = context("user");
        ctx.insert("custom_properties".to_owned(), json!({"plan": "PREMIUM", "seats": 12}));
        assert!(flag.eval(&ctx, &Fnv1aSharder).is_ok());

        ctx.insert("custom_properties".to_owned(), json!({"plan": "premium", "seats": 2}));
        assert_eq!(
            flag.eval(&ctx, &Fnv1aSharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );

        ctx.remove("custom_properties");
        assert_eq!(
            flag.eval(&ctx, &Fnv1aSharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );
    }

    #[test]
    fn broken_declarative_rule_is_an_error() {
        let mut flag = abc_flag();
        flag.ruleset.rollouts[0].runtime_rule =
            Some(RuntimeRule::Declarative(json!({"bogus": [1, 2]})));

        let mut ctx = context("user");
        ctx.insert("custom_properties".to_owned(), json!({}));
        assert!(matches!(
            flag.eval(&ctx, &Fnv1aSharder),
            Err(EvaluationFailure::RuleError(RuleError::Evaluation(_)))
        ));
    }

    #[test]
    fn evaluation_of_definitions_fixture() {
        let body = fs::read("tests/data/flags-definitions.json").unwrap();
        let definitions = FlagDefinitions::from_slice(&body).unwrap();

        // Rule requires plan=premium (case-insensitive) and overrides to C.
        let ctx: Context = HashMap::from([
            ("distinct_id".to_owned(), json!("user-1")),
            ("device_id".to_owned(), json!("device-1")),
            ("custom_properties".to_owned(), json!({"plan": "premium"})),
        ]);
        let result = definitions
            .eval_flag("checkout-experiment", &ctx, &Fnv1aSharder)
            .unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("C"));
        assert_eq!(result.variant_value, json!({"steps": 3, "express": true}));
        assert_eq!(result.is_experiment_active, Some(true));
        assert!(result.experiment_id.is_some());

        // Second rollout forces C via split overrides.
        let ctx: Context = HashMap::from([
            ("distinct_id".to_owned(), json!("user-2")),
            ("device_id".to_owned(), json!("device-2")),
        ]);
        let result = definitions
            .eval_flag("checkout-experiment", &ctx, &Fnv1aSharder)
            .unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("C"));

        // QA testers get their variant, unknown variants fall through.
        let qa: Context = HashMap::from([
            ("distinct_id".to_owned(), json!("qa-user")),
            ("device_id".to_owned(), json!("device-3")),
        ]);
        let result = definitions
            .eval_flag("checkout-experiment", &qa, &Fnv1aSharder)
            .unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("B"));
        assert_eq!(result.is_qa_tester, Some(true));

        let ghost: Context = HashMap::from([
            ("distinct_id".to_owned(), json!("qa-ghost")),
            ("device_id".to_owned(), json!("device-4")),
        ]);
        let result = definitions
            .eval_flag("checkout-experiment", &ghost, &Fnv1aSharder)
            .unwrap();
        assert_eq!(result.variant_key.as_deref(), Some("C"));
        assert_eq!(result.is_qa_tester, Some(false));

        assert_eq!(
            definitions.eval_flag("dark-launch", &context("user-1"), &Fnv1aSharder),
            Err(EvaluationFailure::NoRolloutMatched)
        );
        assert_eq!(
            definitions.eval_flag("broken-flag", &context("user-1"), &Fnv1aSharder),
            Err(EvaluationFailure::FlagNotFound)
        );
    }

    #[test]
    fn reparsed_definitions_evaluate_identically() {
        let body = fs::read("tests/data/flags-definitions.json").unwrap();
        let definitions = FlagDefinitions::from_slice(&body).unwrap();
        let reparsed =
            FlagDefinitions::from_slice(&serde_json::to_vec(&definitions).unwrap()).unwrap();

        for flag_key in definitions.flag_keys() {
            for i in 0..50 {
                let ctx: Context = HashMap::from([
                    ("distinct_id".to_owned(), json!(format!("user-{i}"))),
                    ("device_id".to_owned(), json!(format!("device-{i}"))),
                    (
                        "custom_properties".to_owned(),
                        json!({"plan": if i % 2 == 0 { "premium" } else { "pro" }, "country": "us"}),
                    ),
                ]);
                assert_eq!(
                    definitions.eval_flag(flag_key, &ctx, &Fnv1aSharder),
                    reparsed.eval_flag(flag_key, &ctx, &Fnv1aSharder),
                );
            }
        }
    }

    proptest! {
        #[test]
        fn full_rollout_always_selects_a_variant(distinct_id in "[a-zA-Z0-9-]{1,32}") {
            let result = abc_flag().eval(&context(&distinct_id), &Fnv1aSharder);
            prop_assert!(result.is_ok_and(|variant| variant.is_success()));
        }

        #[test]
        fn evaluation_is_deterministic(distinct_id in "[a-zA-Z0-9-]{1,32}") {
            let flag = abc_flag();
            prop_assert_eq!(
                flag.eval(&context(&distinct_id), &Fnv1aSharder),
                flag.eval(&context(&distinct_id), &Fnv1aSharder)
            );
        }
    }
}
