use crate::RevisionId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("revision `{target}` is not reachable from `{from}`")]
    UnreachableRevision { from: String, target: String },

    #[error("revision history has diverged into multiple heads: {}", join(.heads))]
    DivergentHistory { heads: Vec<RevisionId> },

    #[error("revision `{revision}` is irreversible, no downgrade path crosses it")]
    IrreversibleMigration { revision: RevisionId },

    #[error("revision `{revision}` blocked by validation: {details}")]
    ValidationBlocked {
        revision: RevisionId,
        details: String,
    },

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join(heads: &[RevisionId]) -> String {
    heads
        .iter()
        .map(|id| format!("`{id}`"))
        .collect::<Vec<_>>()
        .join(", ")
}
