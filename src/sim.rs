//! In-process stand-in for a digitizer board.
//!
//! [`SimDigitizer`] keeps the device-side event buffer as a bounded queue of
//! encoded events and answers every [`DigitizerDevice`] primitive the way a
//! board does: triggers are accepted only while armed, the buffer depth
//! follows the applied record length and full buffers obey the configured
//! [`BufferFullPolicy`]. An optional pulser thread fires external triggers
//! at a fixed period, so events accumulate independently of host polling.

use crate::{
    BoardInfo, BufferFullPolicy, ConnectionKind, DigitizerDevice, DigitizerModel, EventInfo,
    EventLayout, GlobalConfig, GroupConfig, LinkParams, RawEventBuffer, ReturnCode,
    TriggerPolarity, HEADER_SIZE,
};
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const FIRMWARE: &str = "ROC 4.25 build 1A08 / AMC 1.07 build 1A17";
const NOISE_COUNTS: i32 = 2;
const PULSE_DECAY_SAMPLES: f64 = 12.0;

#[derive(Debug)]
struct SimCore {
    model: DigitizerModel,
    serial_number: u32,
    global: Option<GlobalConfig>,
    groups: Vec<Option<GroupConfig>>,
    readback_supported: bool,
    pending_fault: Option<ReturnCode>,
    /// Successful reads left before `read_raw_events` fails, and with what.
    read_fault: Option<(u32, ReturnCode)>,

    armed: bool,
    layout: Option<EventLayout>,
    baselines: Vec<u16>,
    depth: u32,
    queue: VecDeque<Vec<u8>>,
    event_counter: u32,
    lost_triggers: u64,
    t_armed: Instant,
    rng: StdRng,
}

impl SimCore {
    fn new(model: DigitizerModel, seed: u64) -> Self {
        Self {
            model,
            serial_number: 20_000 + (seed % 10_000) as u32,
            global: None,
            groups: vec![None; model.constants().num_groups],
            readback_supported: true,
            pending_fault: None,
            read_fault: None,
            armed: false,
            layout: None,
            baselines: Vec::new(),
            depth: 0,
            queue: VecDeque::new(),
            event_counter: 0,
            lost_triggers: 0,
            t_armed: Instant::now(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Consumes an injected fault, if any.
    fn check(&mut self) -> Result<(), ReturnCode> {
        match self.pending_fault.take() {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn check_read(&mut self) -> Result<(), ReturnCode> {
        match self.read_fault {
            Some((0, code)) => {
                self.read_fault = None;
                Err(code)
            }
            Some((left, code)) => {
                self.read_fault = Some((left - 1, code));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn arm(&mut self) -> Result<(), ReturnCode> {
        let global = self.global.as_ref().ok_or(ReturnCode::DigitizerNotReady)?;
        let constants = self.model.constants();
        let groups: Vec<GroupConfig> = self
            .groups
            .iter()
            .map(|g| g.clone().unwrap_or_default())
            .collect();
        let layout = EventLayout::new(constants, global, &groups);
        if layout.channels.is_empty() || layout.record_length == 0 {
            return Err(ReturnCode::DigitizerNotReady);
        }

        let max = f64::from(constants.max_sample());
        self.baselines = layout
            .channels
            .iter()
            .map(|&ch| {
                let offset = groups[ch / constants.channels_per_group].dc_offset;
                (f64::from(offset) / f64::from(u16::MAX) * max).round() as u16
            })
            .collect();
        self.depth = constants.buffer_depth(global.record_length, global.memory_full_mode);
        self.layout = Some(layout);
        self.queue.clear();
        self.event_counter = 0;
        self.lost_triggers = 0;
        self.t_armed = Instant::now();
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn software_trigger(&mut self) {
        let acquires = self
            .global
            .as_ref()
            .is_some_and(|g| g.sw_trigger_mode.acquires());
        if self.armed && acquires {
            self.capture();
        }
    }

    fn external_trigger(&mut self) {
        let acquires = self
            .global
            .as_ref()
            .is_some_and(|g| g.ext_trigger_mode.acquires());
        if self.armed && acquires {
            self.capture();
        }
    }

    fn capture(&mut self) {
        let Some(global) = self.global.as_ref() else {
            return;
        };
        let policy = global.buffer_full_policy;
        let polarity = global.trigger_polarity;
        let pre_trigger = global.pre_trigger_samples() as usize;

        if self.queue.len() as u32 >= self.depth {
            self.lost_triggers += 1;
            match policy {
                BufferFullPolicy::Stall => {
                    debug!("Buffer full ({} events), trigger rejected", self.depth);
                    return;
                }
                BufferFullPolicy::OverwriteOldest => {
                    debug!("Buffer full ({} events), oldest overwritten", self.depth);
                    self.queue.pop_front();
                }
            }
        }

        let Some(layout) = self.layout.as_ref() else {
            return;
        };
        let max = i32::from(layout.max_sample);
        let amplitude = f64::from(max) / 4.0;
        let tag_period = self.model.constants().time_tag_period_ns;
        let elapsed_ns = self.t_armed.elapsed().as_nanos() as f64;

        let mut bytes = Vec::with_capacity(layout.stride());
        EventInfo {
            event_size: layout.stride() as u32,
            board_id: 0,
            pattern: 0,
            group_mask: layout.group_mask,
            event_counter: self.event_counter,
            trigger_time_tag: (elapsed_ns / tag_period) as u64 as u32,
        }
        .encode(&mut bytes);

        for &baseline in &self.baselines {
            for i in 0..layout.record_length {
                let pulse = if i >= pre_trigger {
                    amplitude * (-((i - pre_trigger) as f64) / PULSE_DECAY_SAMPLES).exp()
                } else {
                    0.0
                };
                let pulse = match polarity {
                    TriggerPolarity::RisingEdge => pulse,
                    TriggerPolarity::FallingEdge => -pulse,
                } as i32;
                let noise = self.rng.random_range(-NOISE_COUNTS..=NOISE_COUNTS);
                let sample = (i32::from(baseline) + pulse + noise).clamp(0, max) as u16;
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
        }

        self.event_counter = (self.event_counter + 1) & 0x00FF_FFFF;
        self.queue.push_back(bytes);
    }

    fn read(&mut self, max_count: u32) -> RawEventBuffer {
        let n = (max_count as usize).min(self.queue.len());
        let stride = self.layout.as_ref().map_or(HEADER_SIZE, EventLayout::stride);
        let mut data = Vec::with_capacity(n * stride);
        for event in self.queue.drain(..n) {
            data.extend_from_slice(&event);
        }
        RawEventBuffer::new(data, n as u32)
    }

    fn reset(&mut self) {
        self.global = None;
        self.groups.iter_mut().for_each(|g| *g = None);
        self.armed = false;
        self.layout = None;
        self.baselines.clear();
        self.depth = 0;
        self.queue.clear();
        self.event_counter = 0;
        self.lost_triggers = 0;
    }
}

struct Pulser {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Simulated board implementing [`DigitizerDevice`].
pub struct SimDigitizer {
    model: DigitizerModel,
    core: Arc<Mutex<SimCore>>,
    pulser: Option<Pulser>,
}

impl SimDigitizer {
    pub fn new(model: DigitizerModel, seed: u64) -> Self {
        Self {
            model,
            core: Arc::new(Mutex::new(SimCore::new(model, seed))),
            pulser: None,
        }
    }

    fn core(&self) -> Result<MutexGuard<'_, SimCore>, ReturnCode> {
        self.core.lock().map_err(|_| ReturnCode::GenericError)
    }

    /// Restarts the noise generator from `seed`.
    pub fn reseed(&mut self, seed: u64) -> Result<(), ReturnCode> {
        self.core()?.rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    /// Makes the next primitive fail with `code`.
    pub fn inject_fault(&mut self, code: ReturnCode) {
        if let Ok(mut core) = self.core() {
            core.pending_fault = Some(code);
        }
    }

    /// Lets `reads` event reads succeed, then fails the next one with `code`.
    /// Other primitives are unaffected.
    pub fn fail_read_after(&mut self, reads: u32, code: ReturnCode) {
        if let Ok(mut core) = self.core() {
            core.read_fault = Some((reads, code));
        }
    }

    /// Whether configuration read-back is implemented.
    pub fn set_readback_supported(&mut self, supported: bool) {
        if let Ok(mut core) = self.core() {
            core.readback_supported = supported;
        }
    }

    /// Fires one external (TRG-IN) trigger.
    pub fn external_trigger(&mut self) -> Result<(), ReturnCode> {
        self.core()?.external_trigger();
        Ok(())
    }

    /// Starts a thread firing an external trigger every `period`.
    pub fn start_pulser(&mut self, period: Duration) -> Result<(), ReturnCode> {
        self.stop_pulser();
        let core = Arc::clone(&self.core);
        let ticker = tick(period);
        let (stop, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => match core.lock() {
                    Ok(mut core) => core.external_trigger(),
                    Err(_) => break,
                },
                recv(stop_rx) -> _ => break,
            }
        });
        info!("Test pulser started with a period of {period:?}");
        self.pulser = Some(Pulser { stop, handle });
        Ok(())
    }

    pub fn stop_pulser(&mut self) {
        if let Some(pulser) = self.pulser.take() {
            let _ = pulser.stop.send(());
            if pulser.handle.join().is_err() {
                warn!("Test pulser thread panicked");
            }
            info!("Test pulser stopped");
        }
    }

    pub fn pulser_running(&self) -> bool {
        self.pulser.is_some()
    }
}

impl DigitizerDevice for SimDigitizer {
    fn open(kind: ConnectionKind, model: DigitizerModel, link: LinkParams) -> Result<Self, ReturnCode> {
        debug!(
            "Simulating {model} on {kind:?} link {} node {}",
            link.link_number, link.conet_node
        );
        Ok(Self::new(model, link.link_id(kind).fingerprint()))
    }

    fn model(&self) -> DigitizerModel {
        self.model
    }

    fn board_info(&mut self) -> Result<BoardInfo, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        let constants = core.model.constants();
        Ok(BoardInfo {
            model_name: constants.name.to_string(),
            serial_number: core.serial_number,
            adc_bits: constants.adc_bits,
            channels: constants.num_channels,
            firmware: FIRMWARE.to_string(),
        })
    }

    fn reset(&mut self) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.reset();
        Ok(())
    }

    fn write_global_config(&mut self, config: &GlobalConfig) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        if core.armed {
            return Err(ReturnCode::InvalidDigitizerStatus);
        }
        core.global = Some(config.clone());
        Ok(())
    }

    fn write_group_config(&mut self, group: usize, config: &GroupConfig) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        if core.armed {
            return Err(ReturnCode::InvalidDigitizerStatus);
        }
        let slot = core
            .groups
            .get_mut(group)
            .ok_or(ReturnCode::InvalidChannelNumber)?;
        *slot = Some(config.clone());
        Ok(())
    }

    fn read_global_config(&mut self) -> Result<GlobalConfig, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        if !core.readback_supported {
            return Err(ReturnCode::NotYetImplemented);
        }
        Ok(core.global.clone().unwrap_or_default())
    }

    fn read_group_config(&mut self, group: usize) -> Result<GroupConfig, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        if !core.readback_supported {
            return Err(ReturnCode::NotYetImplemented);
        }
        core.groups
            .get(group)
            .map(|g| g.clone().unwrap_or_default())
            .ok_or(ReturnCode::InvalidChannelNumber)
    }

    fn arm_acquisition(&mut self) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.arm()
    }

    fn disarm_acquisition(&mut self) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.disarm();
        Ok(())
    }

    fn issue_software_trigger(&mut self) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.software_trigger();
        Ok(())
    }

    fn pending_event_count(&mut self) -> Result<u32, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        Ok(core.queue.len() as u32)
    }

    fn read_raw_events(&mut self, max_count: u32) -> Result<RawEventBuffer, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.check_read()?;
        Ok(core.read(max_count))
    }

    fn clear_data(&mut self) -> Result<(), ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        core.queue.clear();
        Ok(())
    }

    fn lost_trigger_count(&mut self) -> Result<u64, ReturnCode> {
        let mut core = self.core()?;
        core.check()?;
        Ok(core.lost_triggers)
    }

    fn close(&mut self) -> Result<(), ReturnCode> {
        self.stop_pulser();
        let mut core = self.core()?;
        core.disarm();
        Ok(())
    }
}

impl Drop for SimDigitizer {
    fn drop(&mut self) {
        self.stop_pulser();
    }
}

/// A link nobody else in this test binary uses.
#[cfg(test)]
pub(crate) fn test_link() -> LinkParams {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    LinkParams {
        link_number: n % 256,
        conet_node: n / 256,
        vme_base_address: 0,
    }
}
