use crate::{
    AcquisitionController, AcquisitionState, AppliedConfig, BoardInfo, BufferDrainEngine,
    ConfigurationManager, Connection, ConnectionKind, DecodedEvent, DigitizerDevice,
    DigitizerError, DigitizerModel, DrainStatus, EventDecoder, EventLayout, EventStore,
    GlobalConfig, GroupConfig, LinkParams, RawEventBuffer, Result,
};
use log::{error, info, warn};

/// One digitizer board with its whole acquisition pipeline.
///
/// Owns the connection exclusively. Dropping it disarms a running
/// acquisition and closes the device.
pub struct Digitizer<D: DigitizerDevice> {
    conn: Connection<D>,
    board: BoardInfo,
    config: ConfigurationManager,
    acquisition: AcquisitionController,
    drain: BufferDrainEngine,
    decoder: Option<EventDecoder>,
    store: EventStore,
}

impl<D: DigitizerDevice> Digitizer<D> {
    pub fn open(kind: ConnectionKind, model: DigitizerModel, link: LinkParams) -> Result<Self> {
        Self::with_connection(Connection::open(kind, model, link)?)
    }

    pub fn with_connection(mut conn: Connection<D>) -> Result<Self> {
        let board = conn.call("board_info", |d| d.board_info())?;
        info!("Model name:\t{}", board.model_name);
        info!("Serial number:\t{}", board.serial_number);
        info!("ADC bits:\t{}", board.adc_bits);
        info!("Channels:\t{}", board.channels);
        info!("Firmware:\t{}", board.firmware);
        Ok(Self {
            conn,
            board,
            config: ConfigurationManager::new(),
            acquisition: AcquisitionController::new(),
            drain: BufferDrainEngine::new(),
            decoder: None,
            store: EventStore::new(),
        })
    }

    pub fn board_info(&self) -> &BoardInfo {
        &self.board
    }

    pub fn model(&self) -> DigitizerModel {
        self.conn.model()
    }

    pub fn connection(&self) -> &Connection<D> {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection<D> {
        &mut self.conn
    }

    // configuration

    /// Validates and writes the settings. Only allowed while disarmed.
    ///
    /// Raw events drained under the previous settings are decoded into the
    /// store with the previous layout before the new one takes over.
    pub fn apply(&mut self, global: &GlobalConfig, groups: &[GroupConfig]) -> Result<()> {
        self.config
            .apply(&mut self.conn, &self.acquisition, global, groups)?;
        self.flush_pending();
        let model = self.conn.model().constants();
        let layout = EventLayout::new(model, global, groups);
        self.drain.configure(model, global, &layout);
        self.decoder = Some(EventDecoder::new(layout));
        Ok(())
    }

    fn flush_pending(&mut self) {
        let pending = self.drain.retrieved();
        if pending == 0 {
            return;
        }
        let Some(decoder) = &self.decoder else {
            warn!("{pending} drained events have no layout to decode them with");
            return;
        };
        // a malformed buffer is already logged and dropped by decode_into
        if let Ok(n) = decoder.decode_into(self.drain.take(), &mut self.store) {
            info!("Decoded {n} events drained under the previous configuration");
        }
    }

    pub fn current(&mut self) -> Result<Option<AppliedConfig>> {
        self.config.current(&mut self.conn)
    }

    pub fn cached_config(&self) -> Option<&AppliedConfig> {
        self.config.cached()
    }

    /// Input range in Vpp of `group` under the applied configuration.
    pub fn voltage_range(&self, group: usize) -> Option<f64> {
        let model = self.conn.model().constants();
        self.config
            .cached()?
            .groups
            .get(group)?
            .voltage_range(model)
    }

    // acquisition

    pub fn arm(&mut self) -> Result<()> {
        self.acquisition.arm(&mut self.conn)?;
        if self.decoder.is_none() {
            // the device took settings written behind the manager's back
            self.acquisition.disarm(&mut self.conn)?;
            return Err(DigitizerError::InvalidState {
                operation: "arm",
                state: AcquisitionState::Disarmed,
            });
        }
        self.drain.allocate();
        Ok(())
    }

    pub fn disarm(&mut self) -> Result<()> {
        self.acquisition.disarm(&mut self.conn)
    }

    pub fn state(&self) -> AcquisitionState {
        self.acquisition.state()
    }

    pub fn software_trigger(&mut self) -> Result<()> {
        self.acquisition.software_trigger(&mut self.conn)
    }

    /// Returns the board to its power-on defaults. Only allowed while
    /// disarmed; the applied configuration and all host data are dropped.
    pub fn reset(&mut self) -> Result<()> {
        self.acquisition.require_disarmed("reset")?;
        self.conn.call("reset", |d| d.reset())?;
        self.acquisition.reset();
        self.config.forget();
        self.drain.unconfigure();
        self.decoder = None;
        self.store.clear();
        info!("{} reset to defaults", self.board.model_name);
        Ok(())
    }

    /// Triggers the device dropped or overwrote on a full buffer, if it
    /// counts them.
    pub fn lost_triggers(&mut self) -> Result<Option<u64>> {
        let lost = self
            .conn
            .call_optional("lost_trigger_count", |d| d.lost_trigger_count())?;
        if let Some(n) = lost.filter(|&n| n > 0) {
            warn!("{n} triggers lost to a full buffer");
        }
        Ok(lost)
    }

    // readout

    pub fn events_pending(&mut self) -> Result<u32> {
        self.drain.events_pending(&mut self.conn)
    }

    pub fn max_possible_buffer_depth(&self) -> u32 {
        self.drain.max_possible_buffer_depth()
    }

    pub fn drain(&mut self, target: u32) -> Result<u32> {
        self.drain.drain(&mut self.conn, target)
    }

    pub fn drain_all(&mut self) -> Result<u32> {
        self.drain.drain_all(&mut self.conn)
    }

    pub fn drain_if_available(&mut self, n: u32) -> Result<bool> {
        self.drain.drain_if_available(&mut self.conn, n)
    }

    pub fn drain_status(&self) -> DrainStatus {
        self.drain.status()
    }

    pub fn drain_engine(&self) -> &BufferDrainEngine {
        &self.drain
    }

    /// Takes the drained raw events out of the host buffer undecoded.
    pub fn take_raw(&mut self) -> RawEventBuffer {
        self.drain.take()
    }

    /// Decodes every drained event into the store. Returns how many were
    /// added.
    pub fn decode(&mut self) -> Result<usize> {
        let decoder = self.decoder.as_ref().ok_or(DigitizerError::InvalidState {
            operation: "decode",
            state: self.acquisition.state(),
        })?;
        decoder.decode_into(self.drain.take(), &mut self.store)
    }

    /// Decodes a raw buffer obtained from [`Digitizer::take_raw`].
    pub fn decode_buffer(&mut self, raw: RawEventBuffer) -> Result<usize> {
        let decoder = self.decoder.as_ref().ok_or(DigitizerError::InvalidState {
            operation: "decode",
            state: self.acquisition.state(),
        })?;
        decoder.decode_into(raw, &mut self.store)
    }

    /// Decodes without storing. Repeatable on the same buffer.
    pub fn decode_preview(&self, raw: &RawEventBuffer) -> Result<Vec<DecodedEvent>> {
        let decoder = self.decoder.as_ref().ok_or(DigitizerError::InvalidState {
            operation: "decode",
            state: self.acquisition.state(),
        })?;
        decoder.decode(raw)
    }

    // events

    pub fn event(&self, index: usize) -> Result<&DecodedEvent> {
        self.store.get(index)
    }

    pub fn event_count(&self) -> usize {
        self.store.count()
    }

    pub fn events(&self) -> &EventStore {
        &self.store
    }

    pub fn clear_events(&mut self) {
        self.store.clear();
    }

    /// Discards device-pending, drained and decoded events alike.
    pub fn clear(&mut self) -> Result<()> {
        self.drain.clear(&mut self.conn)?;
        self.store.clear();
        Ok(())
    }

    /// Disarms and closes the device, reporting failures.
    pub fn close(mut self) -> Result<()> {
        let disarmed = self.acquisition.disarm(&mut self.conn);
        let closed = self.conn.shutdown();
        disarmed.and(closed)
    }
}

impl<D: DigitizerDevice> Drop for Digitizer<D> {
    fn drop(&mut self) {
        if self.acquisition.is_armed() {
            if let Err(e) = self.acquisition.disarm(&mut self.conn) {
                error!("Failed to disarm {} on drop: {e}", self.board.model_name);
            }
        }
    }
}
