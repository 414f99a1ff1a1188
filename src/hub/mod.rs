//! Hub federation: the portal API client, the trusted-cluster lifecycle,
//! and the periodic-updates loop.
//!
//! "Hub" is the long-lived service that hosts cluster images and provides
//! remote support; older material calls the same thing an "Ops Center".

pub mod client;
pub mod trust;
pub mod updates;

pub use client::HubClient;
pub use trust::{HubHandshake, LoggingTunnel, PortalHandshake, ReverseTunnel, TrustManager};
pub use updates::{NoRemote, UpdateLoop, UpdateRemote};
