//! Build orchestration for refkb.
//!
//! This crate ties the reference store, enrichment client, and knowledge-base
//! gateway together into one build run (`KnowledgeBuilder::build`), plus a
//! small registry for running builds in the background.

pub mod builder;
pub mod document;
pub mod enrichment;
pub mod jobs;

pub use builder::{BuildProgress, CANCELLED_REASON, KnowledgeBuilder, SilentProgress};
pub use document::{document_file_name, metadata_values, render_markdown, write_document};
pub use enrichment::{api_link_for, summarize};
pub use jobs::{BuildJobs, JobStatus};
