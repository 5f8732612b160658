pub mod config;
pub mod log_bridge;
pub mod logger;
