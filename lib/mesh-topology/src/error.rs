use thiserror::Error;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Export failed: {0}")]
    ExportFailed(String),

    #[error("Registration is no longer valid: {0}")]
    InvalidRegistration(String),

    #[error("Unknown service: {0}")]
    UnknownService(crate::exporter::ServiceHandle),

    #[error("Invalid export filter: {0}")]
    InvalidFilter(#[from] mesh_core::filter::FilterError),
}
