//! Tools — the static GMod action catalog offered to the model.

pub mod catalog;
pub mod errors;

pub use catalog::ToolCatalog;
pub use errors::ToolError;
