//! Provider control-plane integration.
//!
//! The executor and drift detection reach the outside world only through the
//! [`Provider`] trait. Two implementations ship: an HTTP client and a
//! simulated in-process control plane.

mod api;
mod http;
mod simulated;

pub use api::{ObservedResource, Provider, ProvisionedResource, ResourceRequest};
pub use http::HttpProvider;
pub use simulated::SimulatedProvider;
