//! kubemux authorization layer
//!
//! Two per-cluster building blocks gate every stream subscription:
//!
//! - [`PermissionCache`]: cached, deduplicated RBAC decisions with stale
//!   fallback on transient backend errors
//! - [`AuthStateManager`]: the Valid / Recovering / Invalid state machine that
//!   drives a bounded recovery loop after credentials start failing
//!
//! ```text
//! subscribe ──► PermissionCache ──► AccessReviewer (SSAR)
//!                    │
//! watch error ──► AuthStateManager ──► RecoveryProbe (/version)
//! ```

#![deny(missing_docs)]

pub mod permissions;
pub mod probe;
pub mod review;
pub mod singleflight;
pub mod state;

pub use permissions::{Decision, DecisionSource, PermissionCache, PermissionCacheConfig, PermissionError};
pub use probe::{ApiServerProbe, ProbeError, RecoveryProbe};
pub use review::{AccessReviewer, ReviewError, SelfSubjectAccessReviewer};
pub use singleflight::{FlightAborted, Singleflight};
pub use state::{
    AuthEvent, AuthRecoveryConfig, AuthSnapshot, AuthState, AuthStateManager, RecoveryProgress,
    RECOVERY_EXHAUSTED_REASON,
};
