//! Agent instance pooling and session coordination.
//!
//! [`resource_pool`] owns process-backed agent instances and their ports,
//! [`coordinator`] enforces session admission limits and lifecycles, and
//! [`session_pool`] keeps finished sessions warm for follow-up questions.

pub mod coordinator;
pub mod resource_pool;
pub mod session_pool;

pub use coordinator::{CoordinatorMetrics, SessionAdmission, SessionCoordinator, SessionInfo};
pub use resource_pool::{
    AcquiredInstance, InstanceHandle, InstanceLease, PoolError, PoolMetrics, ResourcePool,
};
pub use session_pool::{PooledSession, SessionPool, SessionPoolMetrics};
