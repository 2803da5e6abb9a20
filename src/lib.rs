//! Fail2ban Agent for Zentinel.
//!
//! Counts infractions per client address and bans repeat offenders by
//! adding them to a regional AWS WAFv2 IP set. Bans expire after a fixed
//! time, lifted by a background sweep.
//!
//! # Features
//!
//! - **Fail2ban Semantics** - `max_retry` infractions within `find_time` ban for `ban_time`
//! - **Optimistic Concurrency** - IP set writes retry on lock-token conflicts
//! - **Shared State** - Infractions in memory or in Redis for several replicas
//! - **Reconciler** - Periodic sweep that prunes records and lifts expired bans
//! - **Restart Safety** - Existing bans are re-adopted on startup
//!
//! # Example Configuration
//!
//! ```yaml
//! jail:
//!   max_retry: 3
//!   find_time_seconds: 600
//!   ban_time_seconds: 1800
//!
//! ip_set:
//!   name: "fail2ban"
//!   region: "eu-west-1"
//!
//! store:
//!   backend: redis
//!   redis_url: "${REDIS_URL}"
//!
//! server:
//!   listen: "0.0.0.0:8000"
//! ```

pub mod address;
pub mod clock;
pub mod config;
pub mod error;
pub mod ipset;
pub mod jailer;
pub mod policy;
pub mod reconciler;
pub mod server;
pub mod store;

pub use address::Address;
pub use config::Config;
pub use error::{JailError, Result};
pub use jailer::{Jail, Jailer};
