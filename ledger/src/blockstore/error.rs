use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockstoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] Box<bincode::ErrorKind>),
}

pub type Result<T> = std::result::Result<T, BlockstoreError>;
