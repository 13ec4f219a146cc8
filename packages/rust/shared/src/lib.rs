//! Shared types, error model, and configuration for refkb.
//!
//! This crate is the foundation depended on by all other refkb crates.
//! It provides:
//! - [`RefKbError`] and the classified remote failure [`ApiError`]
//! - Domain types ([`ReferenceRecord`], [`EnrichedRecord`], [`BuildRequest`], [`BuildResult`])
//! - Configuration ([`AppConfig`], [`TransportConfig`], [`BuildConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BuildConfig, BuildSection, DatabaseConfig, EnrichmentConfig, KnowledgeBaseConfig,
    TransportConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, validate_api_key,
};
pub use error::{ApiError, ApiErrorKind, RefKbError, Result};
pub use types::{
    BuildRequest, BuildResult, DateRange, EnrichedRecord, ExtraAttributes, JobId,
    PublishOutcome, QueryConditions, ReferenceRecord,
};
