pub mod builtin;
pub mod registry;
pub mod validation;

pub use registry::ToolRegistry;
pub use validation::{validate_args, ArgIssue, ValidationOutcome};
