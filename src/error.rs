use thiserror::Error;

/// Failure conditions surfaced by the simulation engine and its collaborators.
#[derive(Debug, Error)]
pub enum SimError {
    /// A per-site operation named a site that is not part of the roster.
    #[error("invalid site reference: {0}")]
    InvalidSiteReference(String),
    /// The snapshot store could not save or load.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    /// The broker could not accept a message.
    #[error("publish unavailable: {0}")]
    PublishUnavailable(String),
    /// Rejected at startup; never raised mid-simulation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
