//! Local evaluation of Mixpanel feature flags.
//!
//! # Overview
//!
//! The crate revolves around a [`LocalFlagsProvider`] that fetches flag definitions from the
//! Mixpanel API, keeps them fresh with a background poller thread, and evaluates flags in process
//! for a [`Context`] describing the subject. Each evaluation results in a [`SelectedVariant`],
//! either the variant chosen by the flag's rollouts or the fallback supplied by the caller.
//!
//! Variant selection is deterministic: a subject always gets the same variant for the same flag
//! definitions. An [`EventSender`] should be provided to record exposure events
//! (`$experiment_started`) for served variants.
//!
//! # Error Handling
//!
//! Evaluation never fails. Whenever a flag can't be evaluated the caller's fallback is returned
//! and the reason is logged. Errors from fetching definitions and managing the poller are
//! represented by the [`Error`] enum.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `mixpanel` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into flag refreshes and evaluation failures.
//!
//! # Examples
//!
//! ```no_run
//! # use mixpanel_flags::{ClientConfig, Context, SelectedVariant};
//! # use serde_json::json;
//! let provider = ClientConfig::from_project_token("project-token").to_provider();
//! provider.start_polling_for_definitions()?;
//!
//! let mut context = Context::new();
//! context.insert("distinct_id".to_owned(), json!("user-1"));
//! let variant = provider.get_variant("new-feature", SelectedVariant::fallback(false), &context, true);
//! # Ok::<(), mixpanel_flags::Error>(())
//! ```
//!
//! More examples can be found in the `demos` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod config;
pub mod definitions_fetcher;
pub mod definitions_store;
mod error;
mod eval;
pub mod exposure;
pub mod flags;
pub mod poller;
pub mod rules;
pub mod sharder;

pub use client::{Context, LocalFlagsProvider, SelectedVariant};
pub use config::ClientConfig;
pub use definitions_fetcher::DefinitionsSource;
pub use error::{Error, EvaluationFailure, Result};
pub use eval::CUSTOM_PROPERTIES;
pub use exposure::{EventSender, ExposureEvent, EXPOSURE_EVENT_NAME};
pub use flags::FlagDefinitions;
pub use poller::PollerThread;
