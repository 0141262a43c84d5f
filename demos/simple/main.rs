use mixpanel_flags::{ClientConfig, Context, SelectedVariant};
use serde_json::{json, Map, Value};

pub fn main() {
    env_logger::init();

    let Ok(project_token) = std::env::var("MIXPANEL_PROJECT_TOKEN") else {
        eprintln!("MIXPANEL_PROJECT_TOKEN is not set");
        return;
    };

    let provider = ClientConfig::from_project_token(project_token)
        .event_sender(
            |distinct_id: &str, event_name: &str, properties: Map<String, Value>| {
                println!("{event_name} for {distinct_id}: {properties:?}");
            },
        )
        .to_provider();

    // Fetch definitions once and keep them fresh in the background. Until the first fetch
    // succeeds, every flag resolves to its fallback.
    if let Err(err) = provider.start_polling_for_definitions() {
        eprintln!("Failed to fetch flag definitions: {err}");
    }

    let mut context = Context::new();
    context.insert("distinct_id".to_owned(), json!("test-subject"));
    context.insert("custom_properties".to_owned(), json!({"plan": "premium"}));

    let variant = provider.get_variant(
        "a-boolean-flag",
        SelectedVariant::fallback(false),
        &context,
        true,
    );
    println!("Variant: {:?}", variant);

    println!("Enabled: {}", provider.is_enabled("a-boolean-flag", &context));

    provider.close();
}
