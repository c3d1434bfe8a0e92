pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod tailer;
pub mod worker;
