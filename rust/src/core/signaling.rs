//! Call document kept in the remote signaling store.
//!
//! Both peers observe the same document through a live query and either of them
//! may write `status`. The core only ever writes status transitions and the final
//! `endedAt`/`duration`; everything else about the document belongs to the app.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use flume::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::SignalingPhase;
use crate::updates::{CoreMsg, InternalEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingStatus {
    Ringing,
    Accepted,
    Ended,
    Declined,
}

impl From<SignalingStatus> for SignalingPhase {
    fn from(status: SignalingStatus) -> Self {
        match status {
            SignalingStatus::Ringing => SignalingPhase::Ringing,
            SignalingStatus::Accepted => SignalingPhase::Accepted,
            SignalingStatus::Ended => SignalingPhase::Ended,
            SignalingStatus::Declined => SignalingPhase::Declined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDocument {
    pub channel_id: String,
    pub status: SignalingStatus,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub callee_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CallDocument {
    pub fn ringing(channel_id: &str, caller_name: &str, callee_name: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            status: SignalingStatus::Ringing,
            caller_name: caller_name.to_string(),
            callee_name: callee_name.to_string(),
            ended_at: None,
            duration: None,
        }
    }

    pub fn parse(json: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(json).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Partial write applied to an existing call document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallDocumentUpdate {
    pub status: SignalingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl CallDocumentUpdate {
    pub fn status(status: SignalingStatus) -> Self {
        Self {
            status,
            ended_at: None,
            duration: None,
        }
    }

    pub fn ended(ended_at: i64, duration: Option<u64>) -> Self {
        Self {
            status: SignalingStatus::Ended,
            ended_at: Some(ended_at),
            duration,
        }
    }

    pub fn apply(&self, doc: &mut CallDocument) {
        doc.status = self.status;
        if self.ended_at.is_some() {
            doc.ended_at = self.ended_at;
        }
        if self.duration.is_some() {
            doc.duration = self.duration;
        }
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("call document not found: {0}")]
    NotFound(String),

    #[error("call document already exists: {0}")]
    AlreadyExists(String),

    #[error("malformed call document: {0}")]
    Malformed(String),

    #[error("signaling backend error: {0}")]
    Backend(String),
}

pub(crate) type SubscriptionId = u64;

/// Live-query access to call documents. Snapshots are delivered to the actor as
/// [`InternalEvent::SignalingSnapshot`].
pub(crate) trait SignalingStore: Send + Sync + 'static {
    fn subscribe(
        &self,
        call_id: &str,
        tx: Sender<CoreMsg>,
    ) -> Result<SubscriptionId, SignalingError>;
    fn unsubscribe(&self, call_id: &str, id: SubscriptionId);
    fn create_call(&self, call_id: &str, document: &CallDocument) -> Result<(), SignalingError>;
    fn update_call(&self, call_id: &str, update: &CallDocumentUpdate)
        -> Result<(), SignalingError>;
}

pub(crate) fn snapshot_msg(call_id: &str, document: Option<CallDocument>) -> CoreMsg {
    CoreMsg::Internal(Box::new(InternalEvent::SignalingSnapshot {
        call_id: call_id.to_string(),
        document,
    }))
}

#[derive(Default)]
struct StoreState {
    next_subscription: SubscriptionId,
    documents: HashMap<String, CallDocument>,
    subscribers: HashMap<String, Vec<(SubscriptionId, Sender<CoreMsg>)>>,
}

impl StoreState {
    fn notify(&mut self, call_id: &str) {
        let document = self.documents.get(call_id).cloned();
        if let Some(subs) = self.subscribers.get_mut(call_id) {
            subs.retain(|(_, tx)| tx.send(snapshot_msg(call_id, document.clone())).is_ok());
        }
    }
}

/// Signaling store living in process memory. Every app instance in the process
/// that uses [`InMemorySignalingStore::shared`] sees the same documents.
#[derive(Clone, Default)]
pub struct InMemorySignalingStore {
    state: Arc<Mutex<StoreState>>,
}

impl std::fmt::Debug for InMemorySignalingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySignalingStore")
            .field("documents", &self.state.lock().documents.len())
            .finish_non_exhaustive()
    }
}

impl InMemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Self {
        static STORE: OnceLock<InMemorySignalingStore> = OnceLock::new();
        STORE.get_or_init(InMemorySignalingStore::new).clone()
    }

    pub fn document(&self, call_id: &str) -> Option<CallDocument> {
        self.state.lock().documents.get(call_id).cloned()
    }

    /// Overwrite a document as another client would, notifying subscribers.
    pub fn put_document(&self, call_id: &str, document: CallDocument) {
        let mut state = self.state.lock();
        state.documents.insert(call_id.to_string(), document);
        state.notify(call_id);
    }

    /// Delete a document; subscribers see it disappear.
    pub fn remove_call(&self, call_id: &str) {
        let mut state = self.state.lock();
        state.documents.remove(call_id);
        state.notify(call_id);
    }

    pub fn subscriber_count(&self, call_id: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(call_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl SignalingStore for InMemorySignalingStore {
    fn subscribe(
        &self,
        call_id: &str,
        tx: Sender<CoreMsg>,
    ) -> Result<SubscriptionId, SignalingError> {
        let mut state = self.state.lock();
        state.next_subscription += 1;
        let id = state.next_subscription;
        // Live queries deliver the current document right away.
        if let Some(doc) = state.documents.get(call_id).cloned() {
            let _ = tx.send(snapshot_msg(call_id, Some(doc)));
        }
        state
            .subscribers
            .entry(call_id.to_string())
            .or_default()
            .push((id, tx));
        Ok(id)
    }

    fn unsubscribe(&self, call_id: &str, id: SubscriptionId) {
        let mut state = self.state.lock();
        if let Some(subs) = state.subscribers.get_mut(call_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                state.subscribers.remove(call_id);
            }
        }
    }

    fn create_call(&self, call_id: &str, document: &CallDocument) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if state.documents.contains_key(call_id) {
            return Err(SignalingError::AlreadyExists(call_id.to_string()));
        }
        state
            .documents
            .insert(call_id.to_string(), document.clone());
        state.notify(call_id);
        Ok(())
    }

    fn update_call(
        &self,
        call_id: &str,
        update: &CallDocumentUpdate,
    ) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        let Some(doc) = state.documents.get_mut(call_id) else {
            return Err(SignalingError::NotFound(call_id.to_string()));
        };
        update.apply(doc);
        state.notify(call_id);
        Ok(())
    }
}
