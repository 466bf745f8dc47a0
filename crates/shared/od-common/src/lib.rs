pub mod env;
pub mod events;
pub mod paths;
pub mod progress;
pub mod token;
pub mod validation;

pub use env::EnvConfig;
pub use events::EventBus;
pub use paths::OdacPaths;
pub use progress::{ProgressSink, ProgressStatus, ProgressUpdate};
