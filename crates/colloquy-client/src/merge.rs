//! Reconciliation of local and server message sequences.
//!
//! A pure function: no I/O, no clocks. The output becomes the new cache
//! contents for the session in one atomic swap.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use colloquy_core::Message;

use crate::cache::CachedMessage;

/// Merge the locally cached sequence with a server-confirmed sequence.
///
/// Entries are keyed by id: all of `local` is inserted first, then
/// `remote`. A remote entry overwrites a local entry sharing its id,
/// because server-confirmed state wins over speculative local state.
/// Local entries whose id the server does not know (pending drafts)
/// are always retained.
///
/// The result is sorted ascending by timestamp with a stable sort, so
/// equal timestamps keep their insertion order.
pub fn merge(local: &[CachedMessage], remote: &[Message]) -> Vec<CachedMessage> {
    let mut slots: HashMap<_, usize> = HashMap::with_capacity(local.len() + remote.len());
    let mut out: Vec<CachedMessage> = Vec::with_capacity(local.len() + remote.len());

    for entry in local {
        match slots.entry(entry.message.id) {
            Entry::Vacant(v) => {
                v.insert(out.len());
                out.push(entry.clone());
            }
            Entry::Occupied(o) => out[*o.get()] = entry.clone(),
        }
    }

    for message in remote {
        let confirmed = CachedMessage::confirmed(message.clone());
        match slots.entry(message.id) {
            Entry::Vacant(v) => {
                v.insert(out.len());
                out.push(confirmed);
            }
            Entry::Occupied(o) => out[*o.get()] = confirmed,
        }
    }

    out.sort_by_key(|entry| entry.message.timestamp);
    out
}
