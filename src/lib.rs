pub mod core;
pub mod error;
pub mod logging;
pub mod platforms;
pub mod storage;

pub use crate::core::queue::{Collaborators, QueueConfig, QueueManager, QueueStats};
pub use crate::error::{QueueError, Result};
