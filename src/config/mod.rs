pub mod loader;
pub mod runtime;
pub mod types;

pub use loader::ConfigLoader;
pub use runtime::EngineConfig;
pub use types::{DelayRange, GlobalConfig, PortStrategy, ToolConfig};
