use thiserror::Error;

/// A string that is not a valid ID of the expected kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Not of the form `{prefix}_{ulid}`.
    #[error("malformed {entity} ID '{value}'")]
    Malformed { entity: &'static str, value: String },

    /// A well-formed ID of some other entity, e.g. a resource ID where a
    /// resource type ID was expected.
    #[error("expected a {entity} ID ('{expected}_' prefix), got '{value}'")]
    WrongKind {
        entity: &'static str,
        expected: &'static str,
        value: String,
    },

    /// The part after the prefix is not a ULID.
    #[error("invalid {entity} ID '{value}': {reason}")]
    BadUlid {
        entity: &'static str,
        value: String,
        reason: String,
    },
}
