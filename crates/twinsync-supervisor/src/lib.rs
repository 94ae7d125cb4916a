//! TwinSync Supervisor
//!
//! Everything around the ingestion core that keeps it running:
//! - Poll-driven hosting of handler instances with one-for-one restarts
//! - Fixed and exponential retry policies
//! - Topology janitor reclaiming unused exchanges, queues and users
//! - Broker management REST client
//! - Environment-driven daemon settings

pub mod host;
pub mod janitor;
pub mod management;
pub mod restart;
pub mod settings;

pub use host::{HandlerHost, HostConfig, Supervised};
pub use janitor::{Janitor, JanitorConfig, JanitorReport, JanitorService, PhaseOutcome};
pub use management::HttpManagementApi;
pub use restart::{BackoffCooldown, RetryPolicy};
pub use settings::{Settings, SettingsError};
