use std::path::{Path, PathBuf};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("No such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("A {kind} named {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("No free address left in subnet {subnet}")]
    Exhausted { subnet: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Malformed port mapping {mapping:?}, expected hostPort:containerPort")]
    MalformedPortMapping { mapping: String },

    #[error("`{tool}` failed: {message}")]
    ExternalTool { tool: &'static str, message: String },

    #[error("Namespace error: {message}")]
    Namespace {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Link error: {message}")]
    Link {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Persistence error on {}: {message}", path.display())]
    Persistence {
        message: String,
        path: PathBuf,
        #[source]
        source: Option<BoxError>,
    },
}

impl NetError {
    pub fn not_found(kind: &'static str, name: &str) -> Self {
        NetError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub fn already_exists(kind: &'static str, name: &str) -> Self {
        NetError::AlreadyExists {
            kind,
            name: name.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        NetError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn namespace(message: impl Into<String>, source: Option<BoxError>) -> Self {
        NetError::Namespace {
            message: message.into(),
            source,
        }
    }

    pub fn link(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        NetError::Link {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn persistence(
        message: impl Into<String>,
        path: &Path,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        NetError::Persistence {
            message: message.into(),
            path: path.to_path_buf(),
            source: Some(Box::new(source)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::NotFound { .. })
    }
}
