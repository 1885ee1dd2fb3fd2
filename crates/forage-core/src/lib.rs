pub mod calendar;
pub mod config;
pub mod domain;
pub mod error;
pub mod event;
pub mod geo;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use domain::*;
pub use error::{ForageError, Result};
pub use event::EventBus;
pub use geo::*;
pub use types::*;
