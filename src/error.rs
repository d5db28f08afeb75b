use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid page format: page_id={0}")]
    InvalidPage(u64),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Size limit exceeded: {what} is {len} bytes, limit is {limit}")]
    SizeLimitExceeded {
        what: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("Commit conflict: root changed from {expected} to {actual} since the transaction began")]
    Conflict { expected: u64, actual: u64 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Duplicate key in table {0}")]
    DuplicateKey(String),

    #[error("Key not found in table {0}")]
    KeyNotFound(String),

    #[error("Value mismatch in table {0}: stored value differs from the logged one")]
    ValueMismatch(String),

    #[error("WAL parse error: {0}")]
    WalParse(String),

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("Replay failed at event {index}: {source}")]
    Replay {
        index: usize,
        #[source]
        source: Box<KvError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KvError {
    /// True for errors the caller can resolve by retrying from a fresh snapshot.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KvError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, KvError>;
