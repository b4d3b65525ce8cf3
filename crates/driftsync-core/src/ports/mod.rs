//! Port definitions (traits for adapters)

pub mod filesystem;
pub mod repository;

pub use filesystem::{
    AllowAll, BisyncOptions, ChangeCallback, CredentialsStore, CryptRemoteParams, FsFeatures,
    LogBuffer, PathFilter, RemoteFs, TransferBackend, TransferContext, TransferOptions,
};
pub use repository::{
    DatabaseGate, DeltaStateStore, HistoryEntry, HistorySink, NullDatabaseGate,
};
