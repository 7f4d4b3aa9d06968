use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::error::{ChannelError, ChannelResult};

/// An id type of a string dictionary on the wire - namespace ids are one byte, element name ids
///  two bytes
pub trait DictionaryId: Copy + Eq + Hash + std::fmt::Debug {
    const KIND: &'static str;
    const CAPACITY: usize;

    fn from_index(index: usize) -> Self;
}

impl DictionaryId for u8 {
    const KIND: &'static str = "namespace";
    const CAPACITY: usize = 256;

    fn from_index(index: usize) -> Self {
        index as u8
    }
}

impl DictionaryId for u16 {
    const KIND: &'static str = "element name";
    const CAPACITY: usize = 65536;

    fn from_index(index: usize) -> Self {
        index as u16
    }
}

/// Send-side string cache: ids are assigned lazily in order of first use, and every newly
///  assigned id must be announced to the peer before it is referenced.
#[derive(Debug)]
pub struct OutgoingDictionary<I: DictionaryId> {
    ids: FxHashMap<String, I>,
}

impl <I: DictionaryId> Default for OutgoingDictionary<I> {
    fn default() -> Self {
        OutgoingDictionary {
            ids: FxHashMap::default(),
        }
    }
}

impl <I: DictionaryId> OutgoingDictionary<I> {
    /// Returns the id for `value` and whether it was newly assigned (i.e. needs an update frame)
    pub fn resolve(&mut self, value: &str) -> ChannelResult<(I, bool)> {
        if let Some(&id) = self.ids.get(value) {
            return Ok((id, false));
        }
        if self.ids.len() >= I::CAPACITY {
            return Err(ChannelError::DictionaryExhausted { kind: I::KIND, limit: I::CAPACITY });
        }
        let id = I::from_index(self.ids.len());
        self.ids.insert(value.to_string(), id);
        Ok((id, true))
    }

    /// Undoes an assignment that was never announced to the peer
    pub fn forget(&mut self, value: &str) {
        self.ids.remove(value);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Receive-side string cache, filled from the peer's update frames
#[derive(Debug)]
pub struct IncomingDictionary<I: DictionaryId> {
    values: FxHashMap<I, String>,
}

impl <I: DictionaryId> Default for IncomingDictionary<I> {
    fn default() -> Self {
        IncomingDictionary {
            values: FxHashMap::default(),
        }
    }
}

impl <I: DictionaryId> IncomingDictionary<I> {
    pub fn insert(&mut self, id: I, value: String) {
        if let Some(prev) = self.values.insert(id, value) {
            // the peer never reassigns ids, but there is no harm in following its lead
            tracing::debug!("peer reassigned {} id {:?} (was {:?})", I::KIND, id, prev);
        }
    }

    pub fn get(&self, id: I) -> ChannelResult<&str> {
        self.values.get(&id)
            .map(|s| s.as_str())
            .ok_or_else(|| ChannelError::protocol_violation(format!("reference to unknown {} id {:?}", I::KIND, id)))
    }
}
