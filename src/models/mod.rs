pub mod account;
pub mod config;

pub use account::{Account, AccountSummary, AuthType, RateLimitOverride, Tier};
pub use config::{AppConfig, CounterReset, ProxyConfig, TeeKeep};
