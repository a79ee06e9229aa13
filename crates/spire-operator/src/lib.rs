/// K8s API objects
pub mod api;

/// Creating planned resources through the cluster client
pub mod apply;

/// Cluster API seam
pub mod client;

/// Operator settings
pub mod config;

/// Pod health aggregation for SpireServer status
pub mod health;

/// Cluster objects derived from a spec
pub mod plan;

/// K8s reconciliation logic
pub mod reconcilers;

/// SPIRE configuration files
pub mod render;

/// Domain rules for specs
pub mod validation;

use thiserror::Error;

use crate::validation::Rejection;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Serde error: {0}")]
    SerdeYaml(#[from] serde_yaml_ng::Error),
    #[error("Spec rejected: {0}")]
    Rejected(#[from] Rejection),
    #[error("Failed to apply {kind} {name}: {source}")]
    Apply {
        kind: &'static str,
        name: String,
        source: Box<Error>,
    },
    #[error("Health observation failed: {0}")]
    Observation(#[source] Box<Error>),
    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
    #[error("Missing field in object reference")]
    MissingField,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
