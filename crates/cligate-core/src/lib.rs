pub mod aggregate;
pub mod chunking;
pub mod config;
pub mod error;
pub mod projects;
pub mod providers;
pub mod registry;
pub mod render;
pub mod sessions;
pub mod stream;

pub use aggregate::*;
pub use chunking::*;
pub use config::*;
pub use error::*;
pub use projects::*;
pub use providers::*;
pub use registry::*;
pub use render::*;
pub use sessions::*;
pub use stream::*;
