use crate::{DigitizerError, Result};
use ndarray::{Array2, ArrayView1};

/// Size in bytes of the header in front of every event.
pub const HEADER_SIZE: usize = 16;
/// Size in bytes of one sample in the raw buffer.
pub const SAMPLE_WIDTH: usize = 2;

const HEADER_MARKER: u32 = 0xA;
const EVENT_SIZE_MASK: u32 = 0x0FFF_FFFF;
const EVENT_COUNTER_MASK: u32 = 0x00FF_FFFF;

/// Per-event header.
///
/// On the wire it is four little-endian 32-bit words:
///
/// | word | bits | content |
/// |---|---|---|
/// | 0 | 31:28 | `0xA` marker |
/// | 0 | 27:0 | event size in bytes, header included |
/// | 1 | 31:27 | board id |
/// | 1 | 23:8 | pattern (LVDS inputs at trigger time) |
/// | 1 | 7:0 | mask of groups present in the event |
/// | 2 | 23:0 | event counter |
/// | 3 | 31:0 | trigger time tag |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventInfo {
    pub event_size: u32,
    pub board_id: u8,
    pub pattern: u16,
    pub group_mask: u8,
    pub event_counter: u32,
    pub trigger_time_tag: u32,
}

impl EventInfo {
    pub fn encode(&self, out: &mut Vec<u8>) {
        let words = [
            HEADER_MARKER << 28 | (self.event_size & EVENT_SIZE_MASK),
            u32::from(self.board_id & 0x1F) << 27
                | u32::from(self.pattern) << 8
                | u32::from(self.group_mask),
            self.event_counter & EVENT_COUNTER_MASK,
            self.trigger_time_tag,
        ];
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(DigitizerError::Decode(format!(
                "header needs {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let word = |i: usize| {
            u32::from_le_bytes([
                bytes[4 * i],
                bytes[4 * i + 1],
                bytes[4 * i + 2],
                bytes[4 * i + 3],
            ])
        };
        let w0 = word(0);
        if w0 >> 28 != HEADER_MARKER {
            return Err(DigitizerError::Decode(format!(
                "bad header marker {:#x}",
                w0 >> 28
            )));
        }
        let w1 = word(1);
        Ok(Self {
            event_size: w0 & EVENT_SIZE_MASK,
            board_id: (w1 >> 27) as u8,
            pattern: (w1 >> 8) as u16,
            group_mask: w1 as u8,
            event_counter: word(2) & EVENT_COUNTER_MASK,
            trigger_time_tag: word(3),
        })
    }

    /// Trigger time in nanoseconds for a time tag clock of `tag_period_ns`.
    pub fn trigger_time_ns(&self, tag_period_ns: f64) -> f64 {
        f64::from(self.trigger_time_tag) * tag_period_ns
    }

    /// Number of groups that contributed to the event.
    pub fn group_count(&self) -> u32 {
        self.group_mask.count_ones()
    }
}

/// One decoded event: header plus one waveform per acquired channel.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEvent {
    pub info: EventInfo,
    /// Absolute channel number of each waveform row.
    channels: Vec<usize>,
    /// Shape `(channels, record_length)`.
    waveforms: Array2<u16>,
}

impl DecodedEvent {
    pub fn new(info: EventInfo, channels: Vec<usize>, waveforms: Array2<u16>) -> Self {
        Self {
            info,
            channels,
            waveforms,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn record_length(&self) -> usize {
        self.waveforms.ncols()
    }

    /// Absolute channel numbers in row order.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    /// Waveform at row `index` (not channel number), if present.
    pub fn waveform(&self, index: usize) -> Option<ArrayView1<'_, u16>> {
        (index < self.channels.len()).then(|| self.waveforms.row(index))
    }

    /// Waveform of absolute channel `channel`, if it was acquired.
    pub fn channel(&self, channel: usize) -> Option<ArrayView1<'_, u16>> {
        let row = self.channels.iter().position(|&ch| ch == channel)?;
        Some(self.waveforms.row(row))
    }

    pub fn waveforms(&self) -> &Array2<u16> {
        &self.waveforms
    }
}
