//! Replicated diagram document backed by a Yrs CRDT.
//!
//! Each namespace (`nodes`, `edges`, ...) is a root `Y.Map` keyed by entry
//! id. Values are opaque JSON stored as Yrs `Any`, so concurrent writes to
//! one entry resolve by the map's last-writer-wins rule, ordered by CRDT
//! ids rather than wall clock. Applying a delta twice is a no-op and deltas
//! commute, which is what lets the hub relay without global ordering.
//!
//! ```text
//! apply_local ──► TransactionMut ──► delta ──► hub broadcast
//! remote delta ──► Update::decode_v1 ──► apply_update (idempotent)
//! export_all ──► { namespace: [ {id, ...value} ] } ──► persistence
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, ReadTxn, StateVector, Transact, Update};

use crate::codec::CodecError;

/// Namespaces every diagram carries, even when empty.
pub const DEFAULT_NAMESPACES: &[&str] = &["nodes", "edges"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// Delta or state vector bytes could not be decoded. Connection-fatal.
    #[error(transparent)]
    Malformed(#[from] CodecError),
    #[error("value cannot be stored: {0}")]
    InvalidValue(String),
    /// Snapshot import attempted after the document was already edited.
    #[error("document already mutated; snapshot import refused")]
    AlreadyMutated,
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

fn malformed(e: impl ToString) -> DocumentError {
    DocumentError::Malformed(CodecError::Malformed(e.to_string()))
}

/// Plain materialized form of a document: namespace → entries ordered by id.
///
/// This is the shape the backing store persists as text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotPayload(pub BTreeMap<String, Vec<Value>>);

impl SnapshotPayload {
    /// True when no namespace holds an entry.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|entries| entries.is_empty())
    }

    /// Total entries across namespaces.
    pub fn entry_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn namespace(&self, name: &str) -> &[Value] {
        self.0.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn to_text(&self) -> Result<String, DocumentError> {
        serde_json::to_string(self).map_err(|e| DocumentError::InvalidSnapshot(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, DocumentError> {
        serde_json::from_str(text).map_err(|e| DocumentError::InvalidSnapshot(e.to_string()))
    }
}

/// The per-room CRDT document.
pub struct ReplicatedDocument {
    doc: Doc,
    namespaces: BTreeSet<String>,
    /// Set by the first successful mutation; gates `import_all`.
    mutated: bool,
}

impl ReplicatedDocument {
    /// Create an empty document with the default namespaces.
    pub fn new() -> Self {
        Self::with_namespaces(DEFAULT_NAMESPACES.iter().copied())
    }

    pub fn with_namespaces<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_doc(Doc::new(), namespaces)
    }

    /// Create with an explicit Yrs client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id), DEFAULT_NAMESPACES.iter().copied())
    }

    fn from_doc<I, S>(doc: Doc, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let namespaces: BTreeSet<String> = namespaces.into_iter().map(Into::into).collect();
        // Root types must exist before the first transaction opens.
        for ns in &namespaces {
            doc.get_or_insert_map(ns.as_str());
        }
        Self { doc, namespaces, mutated: false }
    }

    /// Yrs client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(String::as_str)
    }

    /// Whether any local, remote or imported change has been applied.
    pub fn is_mutated(&self) -> bool {
        self.mutated
    }

    /// Write `value` under `namespace[id]` and return the delta to broadcast.
    ///
    /// Entries are JSON objects; anything else is [`DocumentError::InvalidValue`].
    pub fn apply_local(
        &mut self,
        namespace: &str,
        id: &str,
        value: &Value,
    ) -> Result<Vec<u8>, DocumentError> {
        if !value.is_object() {
            return Err(DocumentError::InvalidValue(format!(
                "entry {namespace}[{id}] must be a JSON object"
            )));
        }
        let any = json_to_any(value)?;
        self.ensure_namespace(namespace);
        let map = self.doc.get_or_insert_map(namespace);

        let delta = {
            let mut txn = self.doc.transact_mut();
            map.insert(&mut txn, id.to_string(), any);
            txn.encode_update_v1()
        };
        self.mutated = true;
        log::trace!("Local write {namespace}[{id}] ({} byte delta)", delta.len());
        Ok(delta)
    }

    /// Delete `namespace[id]`. Returns `None` when the entry did not exist.
    pub fn remove_local(&mut self, namespace: &str, id: &str) -> Option<Vec<u8>> {
        if !self.namespaces.contains(namespace) {
            return None;
        }
        let map = self.doc.get_or_insert_map(namespace);
        let mut txn = self.doc.transact_mut();
        map.remove(&mut txn, id)?;
        let delta = txn.encode_update_v1();
        drop(txn);
        self.mutated = true;
        Some(delta)
    }

    /// Merge a delta produced by another replica.
    ///
    /// Returns whether the document changed. Stale or duplicate deltas are
    /// absorbed silently and return `false`; only undecodable bytes are an
    /// error.
    pub fn apply_remote_delta(&mut self, delta: &[u8]) -> Result<bool, DocumentError> {
        let update = Update::decode_v1(delta).map_err(malformed)?;
        let changed = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update).map_err(malformed)?;
            txn.state_vector() != *txn.before_state() || !txn.delete_set().is_empty()
        };
        if changed {
            self.mutated = true;
        }
        Ok(changed)
    }

    /// Encoded state vector: a summary of everything this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the peer behind `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote = StateVector::decode_v1(state_vector).map_err(malformed)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Full state as a single update, for seeding a fresh replica.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Materialize every known namespace as `[{id, ...value}]` sorted by id.
    pub fn export_all(&self) -> SnapshotPayload {
        let maps: Vec<_> = self
            .namespaces
            .iter()
            .map(|ns| (ns.clone(), self.doc.get_or_insert_map(ns.as_str())))
            .collect();

        let txn = self.doc.transact();
        let mut payload = BTreeMap::new();
        for (ns, map) in maps {
            let mut entries: BTreeMap<String, Value> = BTreeMap::new();
            if let Any::Map(fields) = map.to_json(&txn) {
                for (id, any) in fields.iter() {
                    entries.insert(id.clone(), entry_to_json(id, any));
                }
            }
            payload.insert(ns, entries.into_values().collect());
        }
        SnapshotPayload(payload)
    }

    /// Load a persisted snapshot as local writes.
    ///
    /// Refused once the document has been mutated: a late import would
    /// resurrect entries peers already deleted.
    pub fn import_all(&mut self, payload: &SnapshotPayload) -> Result<Vec<u8>, DocumentError> {
        if self.mutated {
            return Err(DocumentError::AlreadyMutated);
        }

        let mut rows: Vec<(String, String, Any)> = Vec::with_capacity(payload.entry_count());
        for (ns, entries) in &payload.0 {
            for entry in entries {
                match split_entry(entry)? {
                    Some((id, any)) => rows.push((ns.clone(), id, any)),
                    None => log::warn!("Skipping snapshot entry without id in '{ns}'"),
                }
            }
        }

        for ns in payload.0.keys() {
            self.ensure_namespace(ns);
        }
        let maps: BTreeMap<String, _> = payload
            .0
            .keys()
            .map(|ns| (ns.clone(), self.doc.get_or_insert_map(ns.as_str())))
            .collect();

        let delta = {
            let mut txn = self.doc.transact_mut();
            for (ns, id, any) in rows {
                if let Some(map) = maps.get(&ns) {
                    map.insert(&mut txn, id, any);
                }
            }
            txn.encode_update_v1()
        };
        self.mutated = true;
        Ok(delta)
    }

    /// True when every namespace is empty.
    pub fn is_empty(&self) -> bool {
        let maps: Vec<_> = self
            .namespaces
            .iter()
            .map(|ns| self.doc.get_or_insert_map(ns.as_str()))
            .collect();
        let txn = self.doc.transact();
        maps.iter().all(|map| map.len(&txn) == 0)
    }

    /// Read a single entry back as JSON.
    pub fn get(&self, namespace: &str, id: &str) -> Option<Value> {
        if !self.namespaces.contains(namespace) {
            return None;
        }
        let map = self.doc.get_or_insert_map(namespace);
        let txn = self.doc.transact();
        match map.to_json(&txn) {
            Any::Map(fields) => fields.get(id).and_then(|any| serde_json::to_value(any).ok()),
            _ => None,
        }
    }

    fn ensure_namespace(&mut self, namespace: &str) {
        if !self.namespaces.contains(namespace) {
            self.doc.get_or_insert_map(namespace);
            self.namespaces.insert(namespace.to_string());
        }
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn json_to_any(value: &Value) -> Result<Any, DocumentError> {
    serde_json::from_value(value.clone()).map_err(|e| DocumentError::InvalidValue(e.to_string()))
}

/// `{id, ...fields}`. Non-object values written by foreign replicas land
/// under `value`.
fn entry_to_json(id: &str, any: &Any) -> Value {
    let value = serde_json::to_value(any).unwrap_or(Value::Null);
    let mut out = JsonMap::new();
    out.insert("id".to_string(), Value::String(id.to_string()));
    match value {
        Value::Object(fields) => {
            for (k, v) in fields {
                if k != "id" {
                    out.insert(k, v);
                }
            }
        }
        other => {
            out.insert("value".to_string(), other);
        }
    }
    Value::Object(out)
}

/// Inverse of [`entry_to_json`]: every field but `id` becomes the stored
/// object. `Ok(None)` for entries without a string id.
fn split_entry(entry: &Value) -> Result<Option<(String, Any)>, DocumentError> {
    let Value::Object(fields) = entry else {
        return Ok(None);
    };
    let Some(Value::String(id)) = fields.get("id") else {
        return Ok(None);
    };

    let mut rest = fields.clone();
    rest.remove("id");
    Ok(Some((id.clone(), json_to_any(&Value::Object(rest))?)))
}
