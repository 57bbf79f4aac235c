use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown resource type `{name}`")]
    UnknownResourceType { name: String },
    #[error("unknown context `{name}`")]
    UnknownContext { name: String },
}

impl ConfigError {
    pub fn unknown_resource_type(name: impl Into<String>) -> Self {
        Self::UnknownResourceType { name: name.into() }
    }

    pub fn unknown_context(name: impl Into<String>) -> Self {
        Self::UnknownContext { name: name.into() }
    }
}
