use crate::{
    Connection, DigitizerDevice, EventLayout, GlobalConfig, ModelConstants, RawEventBuffer, Result,
};
use log::{debug, info, warn};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

const MIB: f64 = 1024.0 * 1024.0;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Bytes and events moved off the device, plus the throughput of the most
/// recent second of drains.
#[derive(Debug, Clone)]
pub struct Counter {
    /// Bytes drained since `t_begin`.
    pub total_size: usize,
    /// Events drained since `t_begin`.
    pub n_events: usize,
    pub t_begin: Instant,

    recent: VecDeque<(Instant, usize)>,
    recent_bytes: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_size: 0,
            n_events: 0,
            t_begin: Instant::now(),
            recent: VecDeque::new(),
            recent_bytes: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// MiB/s over the counter's whole lifetime.
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.total_size as f64 / secs / MIB
    }

    /// MiB/s over the last second of drains.
    pub fn rate(&self) -> f64 {
        self.recent_bytes as f64 / RATE_WINDOW.as_secs_f64() / MIB
    }

    /// Accounts for one drain of `events` events in `size` bytes.
    pub fn increment(&mut self, size: usize, events: usize) {
        let now = Instant::now();
        self.total_size += size;
        self.n_events += events;
        self.recent.push_back((now, size));
        self.recent_bytes += size;
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, size)) = self.recent.front() {
            if now.duration_since(at) <= RATE_WINDOW {
                break;
            }
            self.recent.pop_front();
            self.recent_bytes -= size;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time view of the drain engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainStatus {
    pub retrieved: u32,
    pub retrieved_bytes: usize,
    pub capacity: u32,
}

/// Moves captured events from the device buffer into host memory in bounded
/// batches. Never waits for events that have not been captured.
#[derive(Debug, Default)]
pub struct BufferDrainEngine {
    host: RawEventBuffer,
    max_events_per_read: u32,
    depth: u32,
    stride: usize,
    counter: Counter,
}

impl BufferDrainEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes batches and capacity for a newly applied configuration.
    pub fn configure(&mut self, model: &ModelConstants, global: &GlobalConfig, layout: &EventLayout) {
        self.max_events_per_read = global.max_events_per_read;
        self.depth = model.buffer_depth(global.record_length, global.memory_full_mode);
        self.stride = layout.stride();
        debug!(
            "Drain sized for {} events of {} bytes, {} per read",
            self.depth, self.stride, self.max_events_per_read
        );
    }

    /// Reserves host memory for one full device buffer.
    pub fn allocate(&mut self) {
        let bytes = self.depth as usize * self.stride;
        self.host.reserve(bytes.saturating_sub(self.host.len()));
    }

    /// Events currently held by the device.
    pub fn events_pending<D: DigitizerDevice>(&self, conn: &mut Connection<D>) -> Result<u32> {
        conn.call("pending_event_count", |d| d.pending_event_count())
    }

    /// Number of events the device can hold under the applied configuration.
    pub fn max_possible_buffer_depth(&self) -> u32 {
        self.depth
    }

    /// Retrieves up to `target` events, stopping early once the device runs
    /// dry. Returns how many events were moved.
    ///
    /// Events already read when a device error interrupts the call have left
    /// the device for good, so they are kept in the host buffer and the error
    /// is returned. [`retrieved`](Self::retrieved) shows how many made it.
    pub fn drain<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>, target: u32) -> Result<u32> {
        let mut batch = RawEventBuffer::default();
        let res = self.read_batches(conn, target, &mut batch);
        let retrieved = batch.event_count();
        if retrieved > 0 {
            self.counter.increment(batch.len(), retrieved as usize);
            debug!(
                "Drained {retrieved} events ({} bytes), {:.2} MiB/s",
                batch.len(),
                self.counter.rate()
            );
        }
        self.host.append(batch);
        match res {
            Ok(()) => Ok(retrieved),
            Err(e) => {
                if retrieved > 0 {
                    warn!("Drain stopped after {retrieved} events: {e}");
                }
                Err(e)
            }
        }
    }

    fn read_batches<D: DigitizerDevice>(
        &self,
        conn: &mut Connection<D>,
        target: u32,
        batch: &mut RawEventBuffer,
    ) -> Result<()> {
        let per_read = self.max_events_per_read.max(1);
        while batch.event_count() < target {
            let pending = self.events_pending(conn)?;
            if pending == 0 {
                break;
            }
            let request = (target - batch.event_count()).min(per_read).min(pending);
            let raw = conn.call("read_raw_events", |d| d.read_raw_events(request))?;
            if raw.event_count() == 0 {
                break;
            }
            batch.append(raw);
        }
        Ok(())
    }

    /// Drains whatever the device holds right now.
    pub fn drain_all<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>) -> Result<u32> {
        let pending = self.events_pending(conn)?;
        self.drain(conn, pending)
    }

    /// Drains only once at least `n` events (or a full buffer, whichever is
    /// smaller) are pending. Returns whether a drain happened.
    pub fn drain_if_available<D: DigitizerDevice>(
        &mut self,
        conn: &mut Connection<D>,
        n: u32,
    ) -> Result<bool> {
        let threshold = if self.depth > 0 { n.min(self.depth) } else { n };
        let pending = self.events_pending(conn)?;
        if pending == 0 || pending < threshold {
            return Ok(false);
        }
        self.drain(conn, pending)?;
        Ok(true)
    }

    /// Hands the accumulated raw events over, leaving the host buffer empty.
    pub fn take(&mut self) -> RawEventBuffer {
        let capacity = self.host.len();
        std::mem::replace(&mut self.host, RawEventBuffer::with_capacity(capacity))
    }

    /// Events held in host memory, not yet taken.
    pub fn retrieved(&self) -> u32 {
        self.host.event_count()
    }

    /// Discards device and host data and resets all counts.
    pub fn clear<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>) -> Result<()> {
        conn.call("clear_data", |d| d.clear_data())?;
        self.clear_host();
        info!("Device and host event buffers cleared");
        Ok(())
    }

    pub(crate) fn clear_host(&mut self) {
        self.host.clear();
        self.counter.reset();
    }

    /// Forgets the configured sizes, e.g. after a device reset.
    pub(crate) fn unconfigure(&mut self) {
        self.clear_host();
        self.max_events_per_read = 0;
        self.depth = 0;
        self.stride = 0;
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn status(&self) -> DrainStatus {
        DrainStatus {
            retrieved: self.host.event_count(),
            retrieved_bytes: self.host.len(),
            capacity: self.depth,
        }
    }
}
