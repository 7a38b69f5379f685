use serde::{Deserialize, Serialize};
use std::fmt;

/// Digitizer families the pipeline knows how to drive.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Family {
    X730,
    X740,
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DigitizerModel {
    #[serde(rename = "DT5730B")]
    Dt5730b,
    #[serde(rename = "DT5740D")]
    Dt5740d,
    #[serde(rename = "V1740D")]
    V1740d,
}

/// Values that never change for a given digitizer model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelConstants {
    pub name: &'static str,
    pub family: Family,
    /// ADC resolution in bits.
    pub adc_bits: u32,
    /// In S/s.
    pub sample_rate_hz: f64,
    /// In S/ch.
    pub memory_per_channel: u32,
    pub num_channels: usize,
    /// Fixed number of configuration groups. Ungrouped models expose one
    /// group per channel.
    pub num_groups: usize,
    pub channels_per_group: usize,
    pub grouped: bool,
    pub max_num_buffers: u32,
    /// Peak-to-peak input ranges, indexed by `GroupConfig::dc_range`.
    pub voltage_ranges: &'static [f64],
    pub supports_decimation: bool,
    pub time_tag_period_ns: f64,
}

const DT5730B: ModelConstants = ModelConstants {
    name: "DT5730B",
    family: Family::X730,
    adc_bits: 14,
    sample_rate_hz: 500e6,
    memory_per_channel: 5_120_000,
    num_channels: 8,
    num_groups: 8,
    channels_per_group: 1,
    grouped: false,
    max_num_buffers: 1024,
    voltage_ranges: &[2.0, 0.5],
    supports_decimation: false,
    time_tag_period_ns: 8.0,
};

const DT5740D: ModelConstants = ModelConstants {
    name: "DT5740D",
    family: Family::X740,
    adc_bits: 12,
    sample_rate_hz: 62.5e6,
    memory_per_channel: 192_000,
    num_channels: 32,
    num_groups: 4,
    channels_per_group: 8,
    grouped: true,
    max_num_buffers: 1024,
    voltage_ranges: &[2.0, 10.0],
    supports_decimation: true,
    time_tag_period_ns: 8.0,
};

const V1740D: ModelConstants = ModelConstants {
    name: "V1740D",
    family: Family::X740,
    adc_bits: 12,
    sample_rate_hz: 62.5e6,
    memory_per_channel: 192_000,
    num_channels: 64,
    num_groups: 8,
    channels_per_group: 8,
    grouped: true,
    max_num_buffers: 1024,
    voltage_ranges: &[2.0],
    supports_decimation: true,
    time_tag_period_ns: 8.0,
};

impl DigitizerModel {
    pub fn constants(self) -> &'static ModelConstants {
        match self {
            Self::Dt5730b => &DT5730B,
            Self::Dt5740d => &DT5740D,
            Self::V1740d => &V1740D,
        }
    }

    pub fn family(self) -> Family {
        self.constants().family
    }
}

impl fmt::Display for DigitizerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.constants().name)
    }
}

/// Whether a full device buffer still counts the last free slot.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFullMode {
    /// The board is full when every buffer is full.
    Normal,
    /// One buffer is always kept free; the board is full at `Nb - 1`.
    #[default]
    OneBufferFree,
}

impl ModelConstants {
    /// Largest sample value the ADC can produce.
    pub fn max_sample(&self) -> u16 {
        ((1u32 << self.adc_bits) - 1) as u16
    }

    /// Number of events the device buffer holds for `record_length` samples
    /// per channel.
    ///
    /// Device memory is split into a power-of-two number of buffers, capped
    /// at `max_num_buffers`. Channel count cancels out because memory is
    /// allocated per channel.
    pub fn buffer_depth(&self, record_length: u32, mode: MemoryFullMode) -> u32 {
        if record_length == 0 {
            return 0;
        }
        let by_memory = self.memory_per_channel / record_length;
        if by_memory == 0 {
            return 0;
        }
        let buffers = (1u32 << by_memory.ilog2()).min(self.max_num_buffers);
        match mode {
            MemoryFullMode::Normal => buffers,
            MemoryFullMode::OneBufferFree => buffers.saturating_sub(1).max(1),
        }
    }

    /// Record length (samples) covering `ns` nanoseconds at the effective,
    /// decimated, sample rate.
    pub fn ns_to_samples(&self, ns: f64, decimation_factor: u16) -> u32 {
        let decimation = f64::from(decimation_factor.max(1));
        (ns * 1e-9 * self.sample_rate_hz / decimation).round() as u32
    }

    /// Converts a voltage into ADC counts for an input range of `range_vpp`.
    pub fn volts_to_counts(&self, volts: f64, range_vpp: f64) -> u32 {
        if range_vpp <= 0.0 {
            return 0;
        }
        let full_scale = f64::from(1u32 << self.adc_bits);
        let counts = (volts / range_vpp * full_scale).round();
        counts.clamp(0.0, f64::from(self.max_sample())) as u32
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum ConnectionKind {
    #[default]
    #[serde(rename = "USB")]
    Usb,
    /// USB to optical link bridge.
    #[serde(rename = "A4818")]
    A4818,
}

impl ConnectionKind {
    /// Nominal link throughput in S/s.
    pub fn transfer_rate(self) -> u32 {
        match self {
            Self::Usb => 15_000_000,
            Self::A4818 => 40_000_000,
        }
    }
}

/// Addressing of one board on its link.
#[derive(Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct LinkParams {
    /// Link number assigned by the host (USB) or the optical link index.
    #[serde(default)]
    pub link_number: u32,
    /// Position in the optical daisy chain.
    #[serde(default)]
    pub conet_node: u32,
    /// VME base address, 0 for desktop boards.
    #[serde(default)]
    pub vme_base_address: u32,
}

impl LinkParams {
    pub fn new(link_number: u32) -> Self {
        Self {
            link_number,
            ..Default::default()
        }
    }

    /// Identifier that is unique per physical board attachment.
    pub fn link_id(&self, kind: ConnectionKind) -> LinkId {
        LinkId { kind, link: *self }
    }
}

/// One physical board attachment. Every address field takes part in full.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct LinkId {
    pub kind: ConnectionKind,
    pub link: LinkParams,
}

impl LinkId {
    /// Folds the attachment into a single number, e.g. to seed a simulator.
    pub fn fingerprint(&self) -> u64 {
        let kind = match self.kind {
            ConnectionKind::Usb => 0,
            ConnectionKind::A4818 => 1,
        };
        (u64::from(self.link.vme_base_address) << 32)
            ^ (u64::from(self.link.conet_node) << 16)
            ^ (u64::from(self.link.link_number) << 1)
            ^ kind
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} link {} node {} VME {:#x}",
            self.kind, self.link.link_number, self.link.conet_node, self.link.vme_base_address
        )
    }
}

/// Identity read from the board once the connection is open.
#[derive(Clone, Debug, PartialEq)]
pub struct BoardInfo {
    pub model_name: String,
    pub serial_number: u32,
    pub adc_bits: u32,
    pub channels: usize,
    pub firmware: String,
}
