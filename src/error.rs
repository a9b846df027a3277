use crate::types::Key;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidedbErrorCode {
    Storage,
    Encode,
    Decode,
    InvalidConfig,
    InvalidCondition,
    CollectionNotFound,
    CollectionReserved,
    DuplicateKey,
    DocumentNotFound,
    UniqueViolation,
    MutatorUnknown,
    MutationNotFound,
    TransactionInactive,
    Remote,
    Closed,
}

impl TidedbErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TidedbErrorCode::Storage => "storage",
            TidedbErrorCode::Encode => "encode",
            TidedbErrorCode::Decode => "decode",
            TidedbErrorCode::InvalidConfig => "invalid_config",
            TidedbErrorCode::InvalidCondition => "invalid_condition",
            TidedbErrorCode::CollectionNotFound => "collection_not_found",
            TidedbErrorCode::CollectionReserved => "collection_reserved",
            TidedbErrorCode::DuplicateKey => "duplicate_key",
            TidedbErrorCode::DocumentNotFound => "document_not_found",
            TidedbErrorCode::UniqueViolation => "unique_violation",
            TidedbErrorCode::MutatorUnknown => "mutator_unknown",
            TidedbErrorCode::MutationNotFound => "mutation_not_found",
            TidedbErrorCode::TransactionInactive => "transaction_inactive",
            TidedbErrorCode::Remote => "remote",
            TidedbErrorCode::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum TidedbError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("invalid condition: {0}")]
    InvalidCondition(String),
    #[error("collection '{collection}' not found")]
    CollectionNotFound { collection: String },
    #[error("collection '{collection}' is reserved")]
    CollectionReserved { collection: String },
    #[error("duplicate key '{key}' in collection '{collection}'")]
    DuplicateKey { collection: String, key: Key },
    #[error("document '{key}' not found in collection '{collection}'")]
    DocumentNotFound { collection: String, key: Key },
    #[error("unique constraint violation on index '{index}' in collection '{collection}'")]
    UniqueViolation { collection: String, index: String },
    #[error("unknown mutator '{name}'")]
    MutatorUnknown { name: String },
    #[error("mutation {id} not found")]
    MutationNotFound { id: i64 },
    #[error("transaction is no longer active")]
    TransactionInactive,
    #[error("remote error: {0}")]
    Remote(String),
    #[error("database is closed")]
    Closed,
}

impl TidedbError {
    pub fn code(&self) -> TidedbErrorCode {
        match self {
            TidedbError::Storage(_) => TidedbErrorCode::Storage,
            TidedbError::Encode(_) => TidedbErrorCode::Encode,
            TidedbError::Decode(_) => TidedbErrorCode::Decode,
            TidedbError::InvalidConfig { .. } => TidedbErrorCode::InvalidConfig,
            TidedbError::InvalidCondition(_) => TidedbErrorCode::InvalidCondition,
            TidedbError::CollectionNotFound { .. } => TidedbErrorCode::CollectionNotFound,
            TidedbError::CollectionReserved { .. } => TidedbErrorCode::CollectionReserved,
            TidedbError::DuplicateKey { .. } => TidedbErrorCode::DuplicateKey,
            TidedbError::DocumentNotFound { .. } => TidedbErrorCode::DocumentNotFound,
            TidedbError::UniqueViolation { .. } => TidedbErrorCode::UniqueViolation,
            TidedbError::MutatorUnknown { .. } => TidedbErrorCode::MutatorUnknown,
            TidedbError::MutationNotFound { .. } => TidedbErrorCode::MutationNotFound,
            TidedbError::TransactionInactive => TidedbErrorCode::TransactionInactive,
            TidedbError::Remote(_) => TidedbErrorCode::Remote,
            TidedbError::Closed => TidedbErrorCode::Closed,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Transient errors are worth retrying against the remote; everything
    /// else is a local programming or data error.
    pub fn is_remote(&self) -> bool {
        matches!(self, TidedbError::Remote(_))
    }
}

/// Covers deserialization of persisted rows only; serialization sites
/// map their failures to [`TidedbError::Encode`] explicitly.
impl From<serde_json::Error> for TidedbError {
    fn from(err: serde_json::Error) -> Self {
        TidedbError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{TidedbError, TidedbErrorCode};
    use crate::types::Key;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(TidedbErrorCode::DuplicateKey.as_str(), "duplicate_key");
        assert_eq!(
            TidedbErrorCode::MutationNotFound.as_str(),
            "mutation_not_found"
        );
        assert_eq!(TidedbErrorCode::Remote.as_str(), "remote");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = TidedbError::DocumentNotFound {
            collection: "todo".into(),
            key: Key::Text("k1".into()),
        };
        assert_eq!(err.code(), TidedbErrorCode::DocumentNotFound);
        assert_eq!(err.code_str(), "document_not_found");
    }
}
