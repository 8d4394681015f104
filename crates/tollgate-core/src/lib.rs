pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod hooks;
pub mod matching;
pub mod pool;
pub mod registry;
pub mod resolver;
pub mod storage_paths;

pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use handlers::*;
pub use hooks::*;
pub use matching::*;
pub use pool::*;
pub use registry::*;
pub use resolver::*;
pub use storage_paths::*;
