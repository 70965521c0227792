//! Core value types shared across the pipeline engine

pub mod environment;
pub mod options;

pub use environment::Environment;
pub use options::{is_build_id, parse_application_id, PipelineKind, PipelineOptions};
