pub mod catalog;
pub mod locate;
pub mod output_validator;
pub mod run_log;
pub mod workflow;

pub use catalog::{Catalog, CatalogBuilder, CategoryStat};
pub use locate::{classify_location, qualify_query, Extraction, LocationExtractor};
pub use output_validator::{OutputCleaner, OutputValidator, ValidationResult};
pub use run_log::RunLogger;
pub use workflow::{
    ContextSnapshot, RunInputs, StageOutput, WorkflowContext, WorkflowCoordinator, WorkflowReport,
};
