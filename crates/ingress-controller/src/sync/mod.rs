//! Convergence of the remote tunnel configuration and DNS records towards the desired state.

pub mod dns;
pub mod tunnel;
