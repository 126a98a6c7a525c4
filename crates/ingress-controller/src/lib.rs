use cloudflare::framework::response::ApiFailure;

pub mod aggregate;
pub mod annotations;
pub mod class;
pub mod controller;
pub mod deployment;
pub mod engine;
pub mod finalizer;
pub mod harvest;
pub mod model;
pub mod status;
pub mod sync;
pub mod tunnel_service;

pub use controller::{ControllerConfig, IngressController};
pub use deployment::CloudflaredConfig;
pub use engine::Engine;
pub use model::KubeApiTunnel;
pub use tunnel_service::{CloudflareTunnelService, TunnelService};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),
    #[error("Cloudflare API Error: {0}")]
    CloudflareApiFailure(#[from] ApiFailure),
    #[error("dns record {0} already exists")]
    RecordAlreadyExists(String),
    #[error("missing namespace for {0}")]
    MissingNamespace(&'static str),
    #[error("service {service} has no port named {port}")]
    MissingServicePort { service: String, port: String },
    #[error("tunnel has not been ensured yet")]
    TunnelNotReady,
    #[error("invalid cloudflared image {0}: {1}")]
    InvalidImage(String, &'static str),
    #[error("no zone found for {0}")]
    MissingZone(String),
}
