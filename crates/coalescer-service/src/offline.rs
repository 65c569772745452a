use std::collections::VecDeque;

use crate::types::RequestId;

/// A bounded FIFO holding requests that arrived while offline.
///
/// When the queue is full, pushing evicts the oldest entry, which is handed back to the caller
/// to be rejected.
#[derive(Debug)]
pub struct OfflineQueue<T> {
    capacity: usize,
    entries: VecDeque<(RequestId, T)>,
}

impl<T> OfflineQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Appends an entry, returning the evicted one if the queue overflowed.
    ///
    /// With a capacity of `0`, the pushed entry itself is returned.
    pub fn push(&mut self, id: RequestId, entry: T) -> Option<(RequestId, T)> {
        if self.capacity == 0 {
            return Some((id, entry));
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back((id, entry));
        evicted
    }

    /// Takes all entries out of the queue, oldest first.
    pub fn drain(&mut self) -> Vec<(RequestId, T)> {
        self.entries.drain(..).collect()
    }

    pub fn remove(&mut self, id: RequestId) -> Option<T> {
        let idx = self.entries.iter().position(|(queued, _)| *queued == id)?;
        self.entries.remove(idx).map(|(_, entry)| entry)
    }

    pub fn get(&self, id: RequestId) -> Option<&T> {
        self.entries
            .iter()
            .find(|(queued, _)| *queued == id)
            .map(|(_, entry)| entry)
    }

    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
