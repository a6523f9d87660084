pub mod error;
pub mod ids;
pub mod memory;
pub mod remote;
pub mod session_store;
pub mod sqlite;
pub mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{StorageError, StorageResult, SyncError, SyncResult};
pub use ids::{MessageId, NEW_SESSION_SENTINEL, SessionId};
pub use memory::MemoryStore;
pub use remote::{HttpSessionSync, OfflineSync, SessionSync, SyncConfig};
pub use session_store::SessionStore;
pub use sqlite::SqliteStore;
pub use types::{
    Attachment, AttachmentKind, Conversion, DEFAULT_SESSION_TITLE, MediaUrls, Message,
    MessageRole, Mode, OutboxEntry, SessionSummary, Tombstone,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Logical partitions of the local key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Per-session message lists, keyed by session id.
    Messages,
    /// Per-session [`SessionSummary`] records, keyed by session id.
    Metadata,
    /// Pending mirror writes, keyed by `<session id>/<message id>`.
    Outbox,
    /// Deletes the remote has not seen, keyed by `<session id>` or
    /// `<session id>/<message id>`.
    Tombstones,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Metadata => "metadata",
            Self::Outbox => "outbox",
            Self::Tombstones => "tombstones",
        }
    }
}

/// Durable key/value store that survives restarts.
///
/// `keys` returns keys in ascending lexicographic order.
pub trait LocalStore: Send + Sync {
    fn get<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Option<String>>>;
    fn put<'a>(
        &'a self,
        namespace: Namespace,
        key: &'a str,
        value: String,
    ) -> BoxFuture<'a, StorageResult<()>>;
    fn remove<'a>(&'a self, namespace: Namespace, key: &'a str) -> BoxFuture<'a, StorageResult<bool>>;
    fn keys<'a>(&'a self, namespace: Namespace) -> BoxFuture<'a, StorageResult<Vec<String>>>;
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}
