//! Ephemeral presence ("awareness") for a room.
//!
//! Every connected client owns one small JSON state (display name, color,
//! cursor, selection, last reaction) tagged with a logical clock. States are
//! never persisted; they live until the owning socket leaves or the client
//! stops refreshing past the liveness window.
//!
//! ## Wire format
//!
//! ```text
//! varuint count
//! repeat count:
//!     varuint client_id
//!     varuint clock
//!     varstring json_state      ("null" = removed)
//! ```
//!
//! An incoming entry wins only if its clock is newer than the one we know,
//! or equal with a `null` state removing a live entry. Removals bump the
//! clock locally so the `null` we send outranks the last state peers saw.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

use crate::codec::CodecError;

/// Yjs client id of a replica.
pub type ClientId = u64;

/// Default liveness window, matching the browser awareness timeout.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cursor colors handed out by join order within a room.
pub const COLORS: [&str; 9] = [
    "#3B82F6", "#F59E0B", "#10B981", "#8B5CF6", "#EC4899", "#06B6D4", "#F43F5E", "#84CC16",
    "#6366F1",
];

/// Color for the `index`-th identified client of a room (wraps around).
pub fn color_for(index: usize) -> &'static str {
    COLORS[index % COLORS.len()]
}

// ───────────────────────────────────────────────────────────────────
// Change sets
// ───────────────────────────────────────────────────────────────────

/// Client ids touched by one presence mutation.
///
/// `updated` also holds clients whose state was merely refreshed; peers
/// need to see the bumped clock to keep them alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChanges {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl PresenceChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every touched client, in added → updated → removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }

    pub fn merge(&mut self, other: PresenceChanges) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Clock bookkeeping. Kept for one liveness window after removal so stale
/// updates stay rejected.
#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Per-room presence states with logical clocks.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    states: HashMap<ClientId, Value>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `partial` into the client's state and bump its clock.
    ///
    /// A `null` field removes that key from the state.
    pub fn set_local_state(&mut self, client_id: ClientId, partial: Map<String, Value>) -> PresenceChanges {
        let mut changes = PresenceChanges::default();
        let clock = self.next_clock(client_id);

        match self.states.get_mut(&client_id) {
            Some(Value::Object(existing)) => {
                merge_fields(existing, partial);
                changes.updated.push(client_id);
            }
            Some(other) => {
                let mut fields = Map::new();
                merge_fields(&mut fields, partial);
                *other = Value::Object(fields);
                changes.updated.push(client_id);
            }
            None => {
                let mut fields = Map::new();
                merge_fields(&mut fields, partial);
                self.states.insert(client_id, Value::Object(fields));
                changes.added.push(client_id);
            }
        }

        self.meta.insert(client_id, ClientMeta { clock, last_updated: Instant::now() });
        changes
    }

    /// Full client → state mapping.
    pub fn get_states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    pub fn state(&self, client_id: ClientId) -> Option<&Value> {
        self.states.get(&client_id)
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop the given clients. Unknown ids are ignored.
    pub fn remove_clients<I>(&mut self, client_ids: I) -> PresenceChanges
    where
        I: IntoIterator<Item = ClientId>,
    {
        let mut changes = PresenceChanges::default();
        for id in client_ids {
            if self.states.remove(&id).is_some() {
                let clock = self.next_clock(id);
                self.meta.insert(id, ClientMeta { clock, last_updated: Instant::now() });
                changes.removed.push(id);
            }
        }
        changes
    }

    /// Merge an encoded presence update received from a peer.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<PresenceChanges, CodecError> {
        let entries = decode_entries(update)?;
        let now = Instant::now();
        let mut changes = PresenceChanges::default();

        for (client_id, clock, state) in entries {
            let known_clock = self.meta.get(&client_id).map(|m| m.clock);
            let is_live = self.states.contains_key(&client_id);
            let is_removal = state.is_null();

            let newer = known_clock.map_or(true, |known| known < clock);
            let equal_removal = known_clock == Some(clock) && is_removal && is_live;
            if !newer && !equal_removal {
                log::trace!("Ignoring stale presence for {client_id} (clock {clock})");
                continue;
            }

            if is_removal {
                if self.states.remove(&client_id).is_some() {
                    changes.removed.push(client_id);
                }
            } else if self.states.insert(client_id, state).is_some() {
                changes.updated.push(client_id);
            } else {
                changes.added.push(client_id);
            }
            self.meta.insert(client_id, ClientMeta { clock, last_updated: now });
        }

        Ok(changes)
    }

    /// Encode the given clients. Removed clients go out as `null` with
    /// their last clock; clients never seen are skipped.
    pub fn encode_update(&self, client_ids: &[ClientId]) -> Vec<u8> {
        let known: Vec<(ClientId, u64)> = client_ids
            .iter()
            .filter_map(|id| self.meta.get(id).map(|m| (*id, m.clock)))
            .collect();

        let mut buf = Vec::with_capacity(8 + known.len() * 32);
        buf.write_var(known.len() as u64);
        for (id, clock) in known {
            buf.write_var(id);
            buf.write_var(clock);
            let json = match self.states.get(&id) {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            buf.write_string(&json);
        }
        buf
    }

    /// Encode every live state (the reply to a presence query).
    pub fn encode_full(&self) -> Vec<u8> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        self.encode_update(&ids)
    }

    /// Remove states that were not refreshed within `window`, and forget
    /// the clocks of clients removed more than `window` ago.
    pub fn expire_stale(&mut self, window: Duration) -> PresenceChanges {
        self.expire_stale_at(Instant::now(), window)
    }

    pub(crate) fn expire_stale_at(&mut self, now: Instant, window: Duration) -> PresenceChanges {
        let states = &self.states;
        self.meta.retain(|id, m| {
            states.contains_key(id) || now.saturating_duration_since(m.last_updated) < window
        });

        let stale: Vec<ClientId> = self
            .states
            .keys()
            .filter(|id| {
                self.meta
                    .get(id)
                    .map(|m| now.saturating_duration_since(m.last_updated) >= window)
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        if !stale.is_empty() {
            log::debug!("Expiring {} stale presence entries", stale.len());
        }
        self.remove_clients(stale)
    }

    fn next_clock(&self, client_id: ClientId) -> u64 {
        self.meta.get(&client_id).map(|m| m.clock.saturating_add(1)).unwrap_or(1)
    }
}

fn merge_fields(target: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (key, value) in partial {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

fn decode_entries(update: &[u8]) -> Result<Vec<(ClientId, u64, Value)>, CodecError> {
    let mut cursor = Cursor::new(update);
    let count: u64 = cursor.read_var()?;
    let remaining = update.len() as u64;
    // Each entry takes at least three bytes
    if count > remaining {
        return Err(CodecError::Malformed(format!(
            "presence update claims {count} entries in {remaining} bytes"
        )));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let client_id: u64 = cursor.read_var()?;
        let clock: u64 = cursor.read_var()?;
        let json = cursor.read_string()?;
        let state: Value = serde_json::from_str(json)
            .map_err(|e| CodecError::Malformed(format!("presence state for {client_id}: {e}")))?;
        entries.push((client_id, clock, state));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn encode_raw(entries: &[(u64, u64, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_var(entries.len() as u64);
        for (id, clock, json) in entries {
            buf.write_var(*id);
            buf.write_var(*clock);
            buf.write_string(json);
        }
        buf
    }

    // ── Local state ─────────────────────────────────────────────

    #[test]
    fn test_set_local_state_adds_then_merges() {
        let mut tracker = PresenceTracker::new();

        let c1 = tracker.set_local_state(1, fields(json!({"displayName": "Ada", "color": "#3B82F6"})));
        assert_eq!(c1.added, vec![1]);
        assert_eq!(tracker.clock(1), Some(1));

        let c2 = tracker.set_local_state(1, fields(json!({"cursor": {"x": 4, "y": 2}})));
        assert_eq!(c2.updated, vec![1]);
        assert_eq!(tracker.clock(1), Some(2));

        let state = tracker.state(1).unwrap();
        assert_eq!(state["displayName"], json!("Ada"));
        assert_eq!(state["cursor"]["x"], json!(4));
    }

    #[test]
    fn test_null_field_clears_key() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local_state(1, fields(json!({"reaction": "👍", "color": "#F59E0B"})));
        tracker.set_local_state(1, fields(json!({"reaction": null})));
        let state = tracker.state(1).unwrap();
        assert!(state.get("reaction").is_none());
        assert_eq!(state["color"], json!("#F59E0B"));
    }

    #[test]
    fn test_remove_clients() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local_state(1, Map::new());
        tracker.set_local_state(2, Map::new());

        let changes = tracker.remove_clients([1, 3]);
        assert_eq!(changes.removed, vec![1]);
        assert_eq!(tracker.len(), 1);
        // Clock bumped so the removal outranks the last state
        assert_eq!(tracker.clock(1), Some(2));
    }

    #[test]
    fn test_remove_client_at_max_clock() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_update(&encode_raw(&[(7, u64::MAX, r#"{"v":1}"#)])).unwrap();

        let changes = tracker.remove_clients([7]);
        assert_eq!(changes.removed, vec![7]);
        assert_eq!(tracker.clock(7), Some(u64::MAX));

        // Peers holding the live entry accept the equal-clock removal
        let mut mirror = PresenceTracker::new();
        mirror.apply_update(&encode_raw(&[(7, u64::MAX, r#"{"v":1}"#)])).unwrap();
        let c = mirror.apply_update(&tracker.encode_update(&changes.removed)).unwrap();
        assert_eq!(c.removed, vec![7]);
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_local_state_at_max_clock_saturates() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_update(&encode_raw(&[(7, u64::MAX, "{}")])).unwrap();
        let changes = tracker.set_local_state(7, fields(json!({"v": 2})));
        assert_eq!(changes.updated, vec![7]);
        assert_eq!(tracker.clock(7), Some(u64::MAX));
    }

    // ── Remote updates ──────────────────────────────────────────

    #[test]
    fn test_apply_update_added_updated_removed() {
        let mut tracker = PresenceTracker::new();

        let c = tracker.apply_update(&encode_raw(&[(7, 1, r#"{"displayName":"Bo"}"#)])).unwrap();
        assert_eq!(c.added, vec![7]);

        let c = tracker.apply_update(&encode_raw(&[(7, 2, r#"{"displayName":"Bob"}"#)])).unwrap();
        assert_eq!(c.updated, vec![7]);
        assert_eq!(tracker.state(7).unwrap()["displayName"], json!("Bob"));

        let c = tracker.apply_update(&encode_raw(&[(7, 3, "null")])).unwrap();
        assert_eq!(c.removed, vec![7]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stale_clock_is_ignored() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_update(&encode_raw(&[(7, 5, r#"{"v":5}"#)])).unwrap();

        let c = tracker.apply_update(&encode_raw(&[(7, 4, r#"{"v":4}"#)])).unwrap();
        assert!(c.is_empty());
        let c = tracker.apply_update(&encode_raw(&[(7, 5, r#"{"v":6}"#)])).unwrap();
        assert!(c.is_empty());
        assert_eq!(tracker.state(7).unwrap()["v"], json!(5));
    }

    #[test]
    fn test_equal_clock_null_removes_live_entry() {
        let mut tracker = PresenceTracker::new();
        tracker.apply_update(&encode_raw(&[(7, 5, r#"{"v":5}"#)])).unwrap();
        let c = tracker.apply_update(&encode_raw(&[(7, 5, "null")])).unwrap();
        assert_eq!(c.removed, vec![7]);
    }

    #[test]
    fn test_malformed_update() {
        let mut tracker = PresenceTracker::new();
        assert!(tracker.apply_update(&[]).is_err());
        assert!(tracker.apply_update(&[200]).is_err());
        assert!(tracker.apply_update(&encode_raw(&[(1, 1, "{not json")])).is_err());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_encode_update_replicates() {
        let mut source = PresenceTracker::new();
        source.set_local_state(1, fields(json!({"displayName": "Ada"})));
        source.set_local_state(2, fields(json!({"displayName": "Bo"})));

        let mut mirror = PresenceTracker::new();
        let c = mirror.apply_update(&source.encode_full()).unwrap();
        assert_eq!(c.added.len(), 2);
        assert_eq!(mirror.get_states(), source.get_states());

        // Removal travels as null with the bumped clock
        let removed = source.remove_clients([1]);
        let c = mirror.apply_update(&source.encode_update(&removed.removed)).unwrap();
        assert_eq!(c.removed, vec![1]);
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_encode_update_skips_unknown_clients() {
        let tracker = PresenceTracker::new();
        assert_eq!(tracker.encode_update(&[42]), vec![0]);
    }

    // ── Expiry ──────────────────────────────────────────────────

    #[test]
    fn test_expire_stale() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local_state(1, Map::new());
        tracker.set_local_state(2, Map::new());

        let now = Instant::now();
        assert!(tracker.expire_stale_at(now, Duration::from_secs(30)).is_empty());

        let later = now + Duration::from_secs(31);
        let mut expired = tracker.expire_stale_at(later, Duration::from_secs(30)).removed;
        expired.sort_unstable();
        assert_eq!(expired, vec![1, 2]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_expire_forgets_removed_clients_after_window() {
        let mut tracker = PresenceTracker::new();
        tracker.set_local_state(1, Map::new());
        tracker.set_local_state(2, Map::new());
        tracker.remove_clients([1]);

        let window = Duration::from_secs(30);
        let now = Instant::now();
        tracker.expire_stale_at(now, window);
        assert_eq!(tracker.clock(1), Some(2));

        // Within the window a replayed state is still rejected
        let c = tracker.apply_update(&encode_raw(&[(1, 1, "{}")])).unwrap();
        assert!(c.is_empty());

        let later = now + Duration::from_secs(31);
        let expired = tracker.expire_stale_at(later, window);
        assert_eq!(expired.removed, vec![2]);
        assert_eq!(tracker.clock(1), None);
        // Client 2 just left; its clock is kept for one more window
        assert_eq!(tracker.clock(2), Some(2));

        tracker.expire_stale_at(later + window, window);
        assert_eq!(tracker.clock(2), None);
    }

    // ── Colors ──────────────────────────────────────────────────

    #[test]
    fn test_color_palette_wraps() {
        assert_eq!(color_for(0), "#3B82F6");
        assert_eq!(color_for(8), "#6366F1");
        assert_eq!(color_for(9), color_for(0));
    }

    #[test]
    fn test_changes_merge_and_list() {
        let mut a = PresenceChanges { added: vec![1], ..Default::default() };
        a.merge(PresenceChanges { removed: vec![2], updated: vec![3], ..Default::default() });
        assert_eq!(a.changed(), vec![1, 3, 2]);
    }
}
