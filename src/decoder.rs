use crate::{
    DecodedEvent, DigitizerError, EventInfo, EventStore, GlobalConfig, GroupConfig, ModelConstants,
    RawEventBuffer, Result, HEADER_SIZE, SAMPLE_WIDTH,
};
use log::{debug, warn};
use ndarray::Array2;

/// Shape of every event produced under one applied configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLayout {
    pub record_length: usize,
    /// Absolute channel numbers, ascending.
    pub channels: Vec<usize>,
    pub group_mask: u8,
    pub max_sample: u16,
}

impl EventLayout {
    pub fn new(model: &ModelConstants, global: &GlobalConfig, groups: &[GroupConfig]) -> Self {
        let mut channels = Vec::new();
        let mut group_mask = 0u8;
        for (index, group) in groups.iter().enumerate() {
            let acquired = group.acquired_channels(index, model);
            if !acquired.is_empty() {
                group_mask |= 1 << index;
            }
            channels.extend(acquired);
        }
        Self {
            record_length: global.record_length as usize,
            channels,
            group_mask,
            max_sample: model.max_sample(),
        }
    }

    /// Bytes one event occupies in a raw buffer.
    pub fn stride(&self) -> usize {
        HEADER_SIZE + self.record_length * self.channels.len() * SAMPLE_WIDTH
    }
}

/// Turns raw device buffers into [`DecodedEvent`]s.
///
/// Decoding is a pure function of the buffer and the layout, so decoding the
/// same unmodified buffer twice yields identical events.
#[derive(Clone, Debug)]
pub struct EventDecoder {
    layout: EventLayout,
}

impl EventDecoder {
    pub fn new(layout: EventLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &EventLayout {
        &self.layout
    }

    /// Decodes every event of `raw` in capture order. Either all events
    /// decode or none are returned.
    pub fn decode(&self, raw: &RawEventBuffer) -> Result<Vec<DecodedEvent>> {
        let stride = self.layout.stride();
        let count = raw.event_count() as usize;
        if count * stride != raw.len() {
            return Err(DigitizerError::Decode(format!(
                "{count} events of {stride} bytes do not fill {} bytes",
                raw.len()
            )));
        }

        let n_channels = self.layout.channels.len();
        let record_length = self.layout.record_length;
        let mut events = Vec::with_capacity(count);
        for (i, chunk) in raw.bytes().chunks_exact(stride).enumerate() {
            let info = EventInfo::parse(chunk)
                .map_err(|e| DigitizerError::Decode(format!("event {i}: {e}")))?;
            if info.event_size as usize != stride {
                return Err(DigitizerError::Decode(format!(
                    "event {i}: header size {} != expected {stride}",
                    info.event_size
                )));
            }
            if info.group_mask != self.layout.group_mask {
                return Err(DigitizerError::Decode(format!(
                    "event {i}: group mask {:#04x} != configured {:#04x}",
                    info.group_mask, self.layout.group_mask
                )));
            }

            let mut samples = Vec::with_capacity(n_channels * record_length);
            for pair in chunk[HEADER_SIZE..].chunks_exact(SAMPLE_WIDTH) {
                let sample = u16::from_le_bytes([pair[0], pair[1]]);
                if sample > self.layout.max_sample {
                    return Err(DigitizerError::Decode(format!(
                        "event {i}: sample {sample} exceeds ADC range {}",
                        self.layout.max_sample
                    )));
                }
                samples.push(sample);
            }
            let waveforms = Array2::from_shape_vec((n_channels, record_length), samples)
                .map_err(|e| DigitizerError::Decode(format!("event {i}: {e}")))?;
            events.push(DecodedEvent::new(
                info,
                self.layout.channels.clone(),
                waveforms,
            ));
        }
        Ok(events)
    }

    /// Takes ownership of `raw`, decodes it and appends the events to
    /// `store`. On failure the buffer is discarded and `store` is untouched.
    pub fn decode_into(&self, raw: RawEventBuffer, store: &mut EventStore) -> Result<usize> {
        match self.decode(&raw) {
            Ok(events) => {
                let n = events.len();
                store.extend(events);
                debug!("Decoded {n} events, store holds {}", store.count());
                Ok(n)
            }
            Err(e) => {
                warn!(
                    "Discarding raw buffer of {} events ({} bytes): {e}",
                    raw.event_count(),
                    raw.len()
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DigitizerModel;

    fn layout() -> EventLayout {
        let model = DigitizerModel::Dt5740d.constants();
        let global = GlobalConfig {
            record_length: 4,
            ..Default::default()
        };
        let mut groups = GroupConfig::defaults_for(model);
        groups[1] = GroupConfig::enabled(2);
        EventLayout::new(model, &global, &groups)
    }

    fn frame(layout: &EventLayout, counter: u32, fill: u16) -> Vec<u8> {
        let mut out = Vec::new();
        EventInfo {
            event_size: layout.stride() as u32,
            group_mask: layout.group_mask,
            event_counter: counter,
            ..Default::default()
        }
        .encode(&mut out);
        for _ in 0..layout.channels.len() * layout.record_length {
            out.extend_from_slice(&fill.to_le_bytes());
        }
        out
    }

    #[test]
    fn layout_follows_enabled_groups() {
        let layout = layout();
        assert_eq!(layout.channels, vec![8, 9]);
        assert_eq!(layout.group_mask, 0b10);
        assert_eq!(layout.stride(), HEADER_SIZE + 4 * 2 * 2);
    }

    #[test]
    fn decodes_in_capture_order() {
        let layout = layout();
        let mut bytes = frame(&layout, 7, 100);
        bytes.extend(frame(&layout, 8, 200));
        let decoder = EventDecoder::new(layout);
        let events = decoder.decode(&RawEventBuffer::new(bytes, 2)).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].info.event_counter, 7);
        assert_eq!(events[1].info.event_counter, 8);
        assert_eq!(events[1].channel(9).unwrap().to_vec(), vec![200; 4]);
    }

    #[test]
    fn count_and_length_must_agree() {
        let layout = layout();
        let bytes = frame(&layout, 0, 1);
        let decoder = EventDecoder::new(layout);
        let err = decoder.decode(&RawEventBuffer::new(bytes, 2)).unwrap_err();
        assert!(matches!(err, DigitizerError::Decode(_)));
    }

    #[test]
    fn out_of_range_sample_rejects_whole_buffer() {
        let layout = layout();
        let mut bytes = frame(&layout, 0, 1);
        bytes.extend(frame(&layout, 1, 4096));
        let decoder = EventDecoder::new(layout);
        let mut store = EventStore::new();
        let res = decoder.decode_into(RawEventBuffer::new(bytes, 2), &mut store);
        assert!(res.is_err());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        let decoder = EventDecoder::new(layout());
        assert!(decoder.decode(&RawEventBuffer::default()).unwrap().is_empty());
    }
}
