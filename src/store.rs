use crate::{DecodedEvent, DigitizerError, Result};
use log::info;
use ndarray::{stack, Array3, Axis};

/// Decoded events in arrival order.
///
/// Nothing is evicted implicitly; the store grows until the caller clears it.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<DecodedEvent>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Result<&DecodedEvent> {
        self.events.get(index).ok_or(DigitizerError::Index {
            index,
            len: self.events.len(),
        })
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.events.is_empty() {
            info!("Clearing {} stored events", self.events.len());
        }
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodedEvent> {
        self.events.iter()
    }

    pub(crate) fn extend(&mut self, events: Vec<DecodedEvent>) {
        self.events.extend(events);
    }

    /// All waveforms as one `(events, channels, samples)` array.
    ///
    /// `None` when the store is empty or holds events of different shapes
    /// (e.g. taken under two configurations).
    pub fn to_array(&self) -> Option<Array3<u16>> {
        let views: Vec<_> = self.events.iter().map(|e| e.waveforms().view()).collect();
        if views.is_empty() {
            return None;
        }
        stack(Axis(0), &views).ok()
    }
}
