use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snafu::ResultExt;
use tokio::sync::Mutex;

use super::error::{DecodeValueSnafu, EncodeValueSnafu, StorageResult, SyncError};
use super::ids::{MessageId, SessionId};
use super::remote::SessionSync;
use super::types::{DEFAULT_SESSION_TITLE, Message, OutboxEntry, SessionSummary, Tombstone};
use super::{LocalStore, Namespace};

/// Local-first session log mirrored to a remote service.
///
/// The local store is authoritative for everything the user has seen. The
/// remote is consulted first on reads and mirrored after every write, but any
/// remote failure falls back to local data instead of surfacing. Writes and
/// deletes the remote missed are parked locally and replayed by
/// [`SessionStore::flush_outbox`].
pub struct SessionStore {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn SessionSync>,
    // Serializes read-modify-write cycles on the local namespaces.
    local_write: Mutex<()>,
}

/// Ids deleted locally whose remote delete is still pending.
#[derive(Debug, Default)]
struct DeletedIds {
    sessions: HashSet<SessionId>,
    messages: HashSet<(SessionId, MessageId)>,
}

impl DeletedIds {
    fn session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains(session_id)
    }

    fn message(&self, session_id: &SessionId, message_id: MessageId) -> bool {
        self.session(session_id) || self.messages.contains(&(session_id.clone(), message_id))
    }
}

impl SessionStore {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn SessionSync>) -> Self {
        Self {
            local,
            remote,
            local_write: Mutex::new(()),
        }
    }

    pub fn create_session(&self) -> SessionId {
        SessionId::generate()
    }

    /// Newest-first session summaries; never fails.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let local = match self.local_summaries().await {
            Ok(summaries) => summaries,
            Err(error) => {
                tracing::error!(error = %error, "failed to scan local session metadata");
                Vec::new()
            }
        };

        let mut summaries = match self.remote.list_sessions().await {
            Ok(remote) => {
                let deleted = self.deleted_ids().await;
                merge_summaries(remote, local, &deleted)
            }
            Err(error) => {
                log_remote_fallback("list-sessions", &error);
                local
            }
        };

        summaries.sort_by(|left, right| {
            right
                .last_modified_ms
                .cmp(&left.last_modified_ms)
                .then_with(|| right.id.cmp(&left.id))
        });
        summaries
    }

    /// Ordered history of one session; empty for the `"new"` sentinel.
    pub async fn get_history(&self, session_id: &SessionId) -> Vec<Message> {
        if session_id.is_sentinel() {
            return Vec::new();
        }

        match self.remote.fetch_history(session_id).await {
            Ok(remote) => match self.adopt_remote_history(session_id, remote).await {
                Ok(merged) => merged,
                Err(error) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %error,
                        "failed to reconcile remote history locally"
                    );
                    self.local_history(session_id).await
                }
            },
            Err(error) if error.is_not_found() => {
                // The remote lost the session; the local copy is still what the user saw.
                let local = self.local_history(session_id).await;
                tracing::info!(
                    session_id = %session_id,
                    has_local_copy = !local.is_empty(),
                    "remote has no record of session"
                );
                local
            }
            Err(error) => {
                log_remote_fallback("get-history", &error);
                self.local_history(session_id).await
            }
        }
    }

    /// The local copy of a session's history, without asking the remote.
    pub async fn local_history(&self, session_id: &SessionId) -> Vec<Message> {
        if session_id.is_sentinel() {
            return Vec::new();
        }

        match self.load_messages(session_id).await {
            Ok(messages) => messages.unwrap_or_default(),
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %error,
                    "failed to read local session history"
                );
                Vec::new()
            }
        }
    }

    /// Upserts one message locally, then mirrors it best-effort.
    ///
    /// Neither local nor remote failures are returned; a failed mirror write is
    /// parked in the outbox for [`SessionStore::flush_outbox`].
    pub async fn save_message(&self, session_id: &SessionId, message: &Message, title: Option<&str>) {
        if session_id.is_sentinel() {
            tracing::warn!(message_id = %message.id, "refusing to save message into sentinel session");
            return;
        }

        let resolved_title = match self.save_local(session_id, message, title).await {
            Ok(title) => Some(title),
            Err(error) => {
                tracing::error!(
                    session_id = %session_id,
                    message_id = %message.id,
                    error = %error,
                    "failed to write message to local store"
                );
                title.map(str::to_string)
            }
        };

        match self
            .remote
            .push_message(session_id, message, resolved_title.as_deref())
            .await
        {
            Ok(()) => {
                // A stale outbox copy of this message must never overwrite what just landed.
                if let Err(error) = self
                    .local
                    .remove(Namespace::Outbox, &outbox_key(session_id, message.id))
                    .await
                {
                    tracing::warn!(error = %error, "failed to drop superseded outbox entry");
                }
                self.flush_outbox().await;
            }
            Err(error) => {
                log_remote_fallback("save-message", &error);
                if !matches!(error, SyncError::NotConfigured { .. }) {
                    self.enqueue_outbox(session_id, message, resolved_title).await;
                }
            }
        }
    }

    /// Local-only overwrite used for edits. Returns `false` when the message
    /// does not exist.
    pub async fn update_message(&self, session_id: &SessionId, message: &Message) -> StorageResult<bool> {
        let _guard = self.local_write.lock().await;
        let Some(mut messages) = self.load_messages(session_id).await? else {
            return Ok(false);
        };
        let Some(slot) = messages.iter_mut().find(|existing| existing.id == message.id) else {
            tracing::debug!(
                session_id = %session_id,
                message_id = %message.id,
                "update skipped for unknown message"
            );
            return Ok(false);
        };

        *slot = message.clone();
        self.store_messages(session_id, &messages).await?;
        Ok(true)
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> StorageResult<()> {
        let remote = self.remote.delete_session(session_id).await;

        let _guard = self.local_write.lock().await;
        self.local
            .remove(Namespace::Messages, session_id.as_str())
            .await?;
        self.local
            .remove(Namespace::Metadata, session_id.as_str())
            .await?;

        // Pending writes and message deletes are subsumed by the session delete.
        let prefix = format!("{session_id}/");
        for namespace in [Namespace::Outbox, Namespace::Tombstones] {
            for key in self.local.keys(namespace).await? {
                if key.starts_with(&prefix) {
                    self.local.remove(namespace, &key).await?;
                }
            }
        }

        let tombstone = Tombstone {
            session_id: session_id.clone(),
            message_id: None,
            deleted_at_ms: crate::unix_timestamp_millis(),
        };
        self.settle_tombstone("delete-session", session_id.as_str(), tombstone, remote)
            .await
    }

    pub async fn delete_message(&self, session_id: &SessionId, message_id: MessageId) -> StorageResult<()> {
        let remote = self.remote.delete_message(session_id, message_id).await;

        let _guard = self.local_write.lock().await;
        let key = outbox_key(session_id, message_id);
        self.local.remove(Namespace::Outbox, &key).await?;

        if let Some(mut messages) = self.load_messages(session_id).await? {
            let before = messages.len();
            messages.retain(|message| message.id != message_id);
            if messages.len() != before {
                self.store_messages(session_id, &messages).await?;
            }
        }

        let tombstone = Tombstone {
            session_id: session_id.clone(),
            message_id: Some(message_id),
            deleted_at_ms: crate::unix_timestamp_millis(),
        };
        self.settle_tombstone("delete-message", &key, tombstone, remote)
            .await
    }

    /// Replays parked deletes, then parked mirror writes, oldest first,
    /// stopping at the first failure. Returns how many entries landed.
    pub async fn flush_outbox(&self) -> usize {
        let (deletes, writes) = match (self.tombstone_entries().await, self.outbox_entries().await) {
            (Ok(deletes), Ok(writes)) => (deletes, writes),
            (Err(error), _) | (_, Err(error)) => {
                tracing::warn!(error = %error, "failed to read mirror outbox");
                return 0;
            }
        };

        let mut flushed = 0;
        for (key, tombstone) in deletes {
            let result = match tombstone.message_id {
                Some(message_id) => {
                    self.remote
                        .delete_message(&tombstone.session_id, message_id)
                        .await
                }
                None => self.remote.delete_session(&tombstone.session_id).await,
            };
            match result {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => {
                    tracing::debug!(
                        session_id = %tombstone.session_id,
                        error = %error,
                        "outbox replay stopped at pending delete"
                    );
                    return report_flushed(flushed);
                }
            }

            if let Err(error) = self.local.remove(Namespace::Tombstones, &key).await {
                tracing::warn!(key = %key, error = %error, "failed to clear replayed delete");
            }
            flushed += 1;
        }

        for (key, entry) in writes {
            if let Err(error) = self
                .remote
                .push_message(&entry.session_id, &entry.message, entry.title.as_deref())
                .await
            {
                tracing::debug!(
                    session_id = %entry.session_id,
                    message_id = %entry.message.id,
                    error = %error,
                    "outbox replay stopped"
                );
                return report_flushed(flushed);
            }

            if let Err(error) = self.local.remove(Namespace::Outbox, &key).await {
                tracing::warn!(key = %key, error = %error, "failed to clear replayed outbox entry");
            }
            flushed += 1;
        }

        report_flushed(flushed)
    }

    /// Parked mirror writes plus parked deletes.
    pub async fn pending_outbox(&self) -> usize {
        let mut pending = 0;
        for namespace in [Namespace::Outbox, Namespace::Tombstones] {
            pending += self
                .local
                .keys(namespace)
                .await
                .map(|keys| keys.len())
                .unwrap_or(0);
        }
        pending
    }

    async fn save_local(
        &self,
        session_id: &SessionId,
        message: &Message,
        title: Option<&str>,
    ) -> StorageResult<String> {
        let _guard = self.local_write.lock().await;

        let mut messages = self.load_messages(session_id).await?.unwrap_or_default();
        match messages.iter_mut().find(|existing| existing.id == message.id) {
            Some(slot) => *slot = message.clone(),
            None => messages.push(message.clone()),
        }
        self.store_messages(session_id, &messages).await?;

        let prior = self.load_summary(session_id).await?;
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(str::to_string)
            .or_else(|| prior.map(|summary| summary.title))
            .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string());

        self.store_summary(&SessionSummary {
            id: session_id.clone(),
            title: title.clone(),
            last_modified_ms: crate::unix_timestamp_millis(),
        })
        .await?;
        Ok(title)
    }

    /// Merges a fetched remote history into the local copy. The local copy is
    /// re-read under the write lock so saves that landed during the fetch
    /// survive; ids with a pending delete are not adopted.
    async fn adopt_remote_history(&self, session_id: &SessionId, remote: Vec<Message>) -> StorageResult<Vec<Message>> {
        let _guard = self.local_write.lock().await;
        let local = self.load_messages(session_id).await?;
        let deleted = self.load_deleted_ids().await?;
        if deleted.session(session_id) {
            return Ok(local.unwrap_or_default());
        }

        let remote = remote
            .into_iter()
            .filter(|message| !deleted.message(session_id, message.id))
            .collect();
        let merged = reconcile_history(local.as_deref().unwrap_or_default(), remote);
        if local.as_ref() == Some(&merged) {
            return Ok(merged);
        }

        self.store_messages(session_id, &merged).await?;
        if self.load_summary(session_id).await?.is_none() {
            let last_modified_ms = merged
                .iter()
                .map(|message| message.timestamp_ms)
                .max()
                .unwrap_or_else(crate::unix_timestamp_millis);
            self.store_summary(&SessionSummary {
                id: session_id.clone(),
                title: DEFAULT_SESSION_TITLE.to_string(),
                last_modified_ms,
            })
            .await?;
        }
        Ok(merged)
    }

    /// Clears the tombstone once the remote has the delete, or parks it when
    /// the remote could not be reached.
    async fn settle_tombstone(
        &self,
        operation: &'static str,
        key: &str,
        tombstone: Tombstone,
        remote: Result<(), SyncError>,
    ) -> StorageResult<()> {
        match remote {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => {
                log_remote_fallback(operation, &error);
                if !matches!(error, SyncError::NotConfigured { .. }) {
                    let value = encode(Namespace::Tombstones, key, &tombstone)?;
                    return self.local.put(Namespace::Tombstones, key, value).await;
                }
            }
        }
        self.local.remove(Namespace::Tombstones, key).await?;
        Ok(())
    }

    async fn enqueue_outbox(&self, session_id: &SessionId, message: &Message, title: Option<String>) {
        let key = outbox_key(session_id, message.id);
        let entry = OutboxEntry {
            session_id: session_id.clone(),
            message: message.clone(),
            title,
            enqueued_at_ms: crate::unix_timestamp_millis(),
        };

        let result = match serde_json::to_string(&entry).context(EncodeValueSnafu {
            stage: "outbox-encode",
            namespace: Namespace::Outbox.as_str(),
            key: key.clone(),
        }) {
            Ok(value) => self.local.put(Namespace::Outbox, &key, value).await,
            Err(error) => Err(error),
        };

        if let Err(error) = result {
            tracing::warn!(key = %key, error = %error, "failed to park mirror write in outbox");
        }
    }

    async fn outbox_entries(&self) -> StorageResult<Vec<(String, OutboxEntry)>> {
        let mut entries = Vec::new();
        for key in self.local.keys(Namespace::Outbox).await? {
            let Some(raw) = self.local.get(Namespace::Outbox, &key).await? else {
                continue;
            };
            match decode::<OutboxEntry>(Namespace::Outbox, &key, &raw) {
                Ok(entry) => entries.push((key, entry)),
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "dropping undecodable outbox entry");
                    self.local.remove(Namespace::Outbox, &key).await?;
                }
            }
        }

        entries.sort_by(|(_, left), (_, right)| {
            left.enqueued_at_ms
                .cmp(&right.enqueued_at_ms)
                .then_with(|| left.message.id.cmp(&right.message.id))
        });
        Ok(entries)
    }

    async fn tombstone_entries(&self) -> StorageResult<Vec<(String, Tombstone)>> {
        let mut entries = Vec::new();
        for key in self.local.keys(Namespace::Tombstones).await? {
            let Some(raw) = self.local.get(Namespace::Tombstones, &key).await? else {
                continue;
            };
            match decode::<Tombstone>(Namespace::Tombstones, &key, &raw) {
                Ok(tombstone) => entries.push((key, tombstone)),
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "dropping undecodable pending delete");
                    self.local.remove(Namespace::Tombstones, &key).await?;
                }
            }
        }

        entries.sort_by_key(|(_, tombstone)| tombstone.deleted_at_ms);
        Ok(entries)
    }

    async fn load_deleted_ids(&self) -> StorageResult<DeletedIds> {
        let mut deleted = DeletedIds::default();
        for (_, tombstone) in self.tombstone_entries().await? {
            match tombstone.message_id {
                Some(message_id) => {
                    deleted.messages.insert((tombstone.session_id, message_id));
                }
                None => {
                    deleted.sessions.insert(tombstone.session_id);
                }
            }
        }
        Ok(deleted)
    }

    async fn deleted_ids(&self) -> DeletedIds {
        match self.load_deleted_ids().await {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!(error = %error, "failed to read pending deletes");
                DeletedIds::default()
            }
        }
    }

    async fn local_summaries(&self) -> StorageResult<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for key in self.local.keys(Namespace::Metadata).await? {
            let Some(raw) = self.local.get(Namespace::Metadata, &key).await? else {
                continue;
            };
            match decode::<SessionSummary>(Namespace::Metadata, &key, &raw) {
                Ok(summary) => summaries.push(summary),
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "skipping unreadable session metadata");
                }
            }
        }
        Ok(summaries)
    }

    async fn load_summary(&self, session_id: &SessionId) -> StorageResult<Option<SessionSummary>> {
        let key = session_id.as_str();
        self.local
            .get(Namespace::Metadata, key)
            .await?
            .map(|raw| decode(Namespace::Metadata, key, &raw))
            .transpose()
    }

    async fn store_summary(&self, summary: &SessionSummary) -> StorageResult<()> {
        let key = summary.id.as_str();
        let value = encode(Namespace::Metadata, key, summary)?;
        self.local.put(Namespace::Metadata, key, value).await
    }

    async fn load_messages(&self, session_id: &SessionId) -> StorageResult<Option<Vec<Message>>> {
        let key = session_id.as_str();
        self.local
            .get(Namespace::Messages, key)
            .await?
            .map(|raw| decode(Namespace::Messages, key, &raw))
            .transpose()
    }

    async fn store_messages(&self, session_id: &SessionId, messages: &[Message]) -> StorageResult<()> {
        let key = session_id.as_str();
        let value = encode(Namespace::Messages, key, &messages)?;
        self.local.put(Namespace::Messages, key, value).await
    }
}

/// Merges the remote list with sessions that only exist locally; for shared
/// ids the more recent `last_modified` wins. Sessions deleted locally but
/// not yet remotely are left out.
fn merge_summaries(
    remote: Vec<SessionSummary>,
    local: Vec<SessionSummary>,
    deleted: &DeletedIds,
) -> Vec<SessionSummary> {
    let mut merged: HashMap<SessionId, SessionSummary> = remote
        .into_iter()
        .filter(|summary| !deleted.session(&summary.id))
        .map(|summary| (summary.id.clone(), summary))
        .collect();

    for summary in local {
        match merged.get(&summary.id) {
            Some(existing) if existing.last_modified_ms >= summary.last_modified_ms => {}
            _ => {
                merged.insert(summary.id.clone(), summary);
            }
        }
    }

    merged.into_values().collect()
}

/// Union of both histories keyed by message id. Local copies win on
/// conflict; the result is ordered by (time-derived) message id.
fn reconcile_history(local: &[Message], remote: Vec<Message>) -> Vec<Message> {
    let mut merged = local.to_vec();
    for message in remote {
        if !merged.iter().any(|existing| existing.id == message.id) {
            merged.push(message);
        }
    }
    merged.sort_by_key(|message| message.id);
    merged
}

fn outbox_key(session_id: &SessionId, message_id: MessageId) -> String {
    format!("{session_id}/{message_id}")
}

fn encode<T: serde::Serialize + ?Sized>(namespace: Namespace, key: &str, value: &T) -> StorageResult<String> {
    serde_json::to_string(value).context(EncodeValueSnafu {
        stage: "local-encode",
        namespace: namespace.as_str(),
        key: key.to_string(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(namespace: Namespace, key: &str, raw: &str) -> StorageResult<T> {
    serde_json::from_str(raw).context(DecodeValueSnafu {
        stage: "local-decode",
        namespace: namespace.as_str(),
        key: key.to_string(),
    })
}

fn log_remote_fallback(operation: &'static str, error: &SyncError) {
    match error {
        SyncError::NotConfigured { .. } => {
            tracing::trace!(operation, "remote sync not configured; using local store");
        }
        _ => {
            tracing::warn!(operation, error = %error, "remote sync failed; using local store");
        }
    }
}

fn report_flushed(flushed: usize) -> usize {
    if flushed > 0 {
        tracing::info!(flushed, "replayed pending mirror writes");
    }
    flushed
}
