pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod participant;
pub mod traits;
pub mod types;
pub mod workflow;

pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use error::{Ineligibility, Result, WorkflowError};
pub use event::EventBus;
pub use participant::*;
pub use types::*;
pub use workflow::*;
