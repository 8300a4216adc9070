pub mod errors;
pub mod transitions;
pub mod types;

pub use errors::{JobError, Result};
pub use types::*;
