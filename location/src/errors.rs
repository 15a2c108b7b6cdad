use crate::client::ClientError;
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum LocationError {
    #[error("service definition {service_type}/{identifier} does not exist")]
    ServiceDefinitionDoesNotExist {
        service_type: String,
        identifier: Uuid,
    },

    #[error("service definition of type {service_type} has no usable location")]
    InvalidServiceDefinition { service_type: String },

    #[error("access mapping {moniker} has no access point")]
    InvalidAccessPoint { moniker: String },

    #[error("connected as {actual}, but this connection belongs to {expected}")]
    IdentityMismatch { expected: String, actual: String },

    #[error("default access mapping {0} is not among the server's access mappings")]
    MissingDefaultAccessMapping(String),

    #[error("no {0} access mapping is available after connecting")]
    MissingAccessMapping(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

impl LocationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, LocationError::Client(ClientError::Timeout))
    }
}
