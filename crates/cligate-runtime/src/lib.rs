mod error;
mod orchestrator;
mod process;
mod queue;

pub use error::*;
pub use orchestrator::*;
pub use process::*;
pub use queue::*;
