//! The client-facing KV application (spec §6): the concrete
//! [`crate::bft::executable::Service`] that the consensus pipeline
//! replicates, built directly on top of the [`Storage`] engine.

use serde::{Deserialize, Serialize};

use crate::bft::error::*;
use crate::bft::executable::Service;
use crate::bft::storage::{Storage, VersionedValue};

/// Every command the client-facing KV API understands (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvRequest {
    Set { key: String, value: String },
    Get { key: String },
    SetWithVersion { key: String, value: String, version: u64 },
    GetWithVersion { key: String, version: u64 },
    GetAllItems,
    GetKeyRange { min_key: String, max_key: String },
    GetHistory { key: String, min_version: u64, max_version: u64 },
    GetTopHistory { key: String, count: usize },
    Delete { key: String },
}

/// The reply shape for every [`KvRequest`] variant.
///
/// Errors surfaced by the storage engine (`VersionMismatch`,
/// `VersionedKeyExists`, `NonVersionedKeyExists`) are carried as a typed
/// reply rather than aborting the batch -- spec §7 requires state-machine
/// errors to reach the client in the reply, not take down the replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvReply {
    Ok,
    Value(Option<String>),
    ValueWithVersion(Option<VersionedValue>),
    Items(Vec<(String, VersionedValue)>),
    History(Vec<VersionedValue>),
    Err(KvErrorReply),
}

/// A serializable projection of the subset of [`ErrorKind`] a client can
/// observe; everything else is a replica-internal fault the client never
/// sees directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum KvErrorReply {
    VersionMismatch,
    VersionedKeyExists,
    NonVersionedKeyExists,
}

impl KvErrorReply {
    fn from_error(e: &Error) -> Option<Self> {
        match e.kind() {
            ErrorKind::VersionMismatch => Some(Self::VersionMismatch),
            ErrorKind::VersionedKeyExists => Some(Self::VersionedKeyExists),
            ErrorKind::NonVersionedKeyExists => Some(Self::NonVersionedKeyExists),
            _ => None,
        }
    }
}

/// Wraps a [`Storage`] backend as a replicated [`Service`].
///
/// `S::State` is the storage handle itself -- cheap to clone (an `Arc`
/// underneath), which is what lets the executor snapshot it for a
/// checkpoint without copying the whole key space.
pub struct KvService<S> {
    backend: S,
}

impl<S> KvService<S> {
    pub fn new(backend: S) -> Self {
        Self { backend }
    }
}

impl<S> Service for KvService<S>
where
    S: Storage + Clone + 'static,
{
    type State = S;
    type Request = KvRequest;
    type Reply = KvReply;

    fn initial_state(&mut self) -> Result<Self::State> {
        Ok(self.backend.clone())
    }

    fn update(&mut self, state: &mut Self::State, request: Self::Request) -> Result<Self::Reply> {
        let result = apply(state, request);
        match result {
            Ok(reply) => Ok(reply),
            Err(e) => match KvErrorReply::from_error(&e) {
                Some(kv_err) => Ok(KvReply::Err(kv_err)),
                None => Err(e),
            },
        }
    }
}

fn apply<S: Storage>(storage: &mut S, request: KvRequest) -> Result<KvReply> {
    match request {
        KvRequest::Set { key, value } => {
            storage.set(&key, &value)?;
            Ok(KvReply::Ok)
        }
        KvRequest::Get { key } => Ok(KvReply::Value(storage.get(&key)?)),
        KvRequest::SetWithVersion { key, value, version } => {
            let new_version = storage.set_with_version(&key, &value, version)?;
            Ok(KvReply::ValueWithVersion(Some((value, new_version))))
        }
        KvRequest::GetWithVersion { key, version } => {
            Ok(KvReply::ValueWithVersion(storage.get_with_version(&key, version)?))
        }
        KvRequest::GetAllItems => {
            let items = storage.get_all_items()?;
            Ok(KvReply::Items(items.into_iter().collect()))
        }
        KvRequest::GetKeyRange { min_key, max_key } => {
            let items = storage.get_key_range(&min_key, &max_key)?;
            Ok(KvReply::Items(items.into_iter().collect()))
        }
        KvRequest::GetHistory { key, min_version, max_version } => {
            Ok(KvReply::History(storage.get_history(&key, min_version, max_version)?))
        }
        KvRequest::GetTopHistory { key, count } => Ok(KvReply::History(storage.get_top_history(&key, count)?)),
        KvRequest::Delete { key } => {
            storage.delete(&key)?;
            Ok(KvReply::Ok)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::storage::MemoryBackend;

    #[test]
    fn set_then_get_roundtrips_through_the_service() {
        let mut service = KvService::new(MemoryBackend::new());
        let mut state = service.initial_state().unwrap();
        let reply = service
            .update(&mut state, KvRequest::Set { key: "a".into(), value: "1".into() })
            .unwrap();
        assert!(matches!(reply, KvReply::Ok));
        let reply = service.update(&mut state, KvRequest::Get { key: "a".into() }).unwrap();
        assert!(matches!(reply, KvReply::Value(Some(v)) if v == "1"));
    }

    #[test]
    fn version_mismatch_surfaces_as_typed_reply_not_an_error() {
        let mut service = KvService::new(MemoryBackend::new());
        let mut state = service.initial_state().unwrap();
        service
            .update(&mut state, KvRequest::SetWithVersion { key: "x".into(), value: "v1".into(), version: 0 })
            .unwrap();
        let reply = service
            .update(&mut state, KvRequest::SetWithVersion { key: "x".into(), value: "v2".into(), version: 0 })
            .unwrap();
        assert!(matches!(reply, KvReply::Err(KvErrorReply::VersionMismatch)));
    }
}
