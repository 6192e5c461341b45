pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{month_end, month_start, Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{TaskflowError, TaskflowResult};
