//! Pipeline definition file parsing

mod config;

pub use config::{
    AuthDefinition, BoxDefinition, BoxEntry, Config, ConfigError, PipelineDefinition,
    StepDefinition, StepEntry, WorkflowDefinition, WorkflowPipelineDefinition,
};
