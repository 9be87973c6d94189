// Session lifecycle: admission, quotas, expiry and activity accounting

pub mod manager;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use manager::SessionManager;
pub use quota::QuotaTracker;
pub use registry::SessionRegistry;
pub use scheduler::{LifecycleScheduler, SchedulerSettings};
pub use types::{
    ManagerSettings, Session, SessionError, SessionIdGenerator, SessionLimits,
    SessionLimitsUpdate, SessionStatus, StopReason, UserStats,
};
