//! Repository handles and the fleet registry

mod handle;
mod registry;

pub use handle::RepositoryHandle;
pub use registry::{summarize, Fleet, ALL_PATTERN};
