//! Connection management: lifecycle, reconnection, and the driver task.
//!
//! [`manager`] owns the caller-facing [`HubClient`] handle and the serialized
//! driver loop; [`backoff`] provides the exponential reconnect schedule the
//! driver sleeps on between attempts.

pub mod backoff;
pub mod manager;

pub use backoff::Backoff;
pub use manager::HubClient;
