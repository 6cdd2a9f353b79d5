mod loader;
mod settings;

pub use loader::{has_changed, ConfigError, ConfigLoader, FeedDefaults};
pub use settings::{RunSettings, Settings};
