pub mod agent;
pub mod logging;
pub mod settings;
pub mod store;

pub use settings::Settings;
