//! Seam between the acquisition pipeline and the hardware access layer.
//!
//! The register-level library is a black box: everything the pipeline needs
//! from it is the [`DigitizerDevice`] trait. Primitives report the raw
//! [`ReturnCode`]; [`Connection`] turns those into [`DigitizerError`]s, owns
//! the device exclusively and closes it on every exit path.

use crate::{
    BoardInfo, ConnectionKind, DigitizerError, DigitizerModel, GlobalConfig, GroupConfig,
    LinkId, LinkParams, Result, ReturnCode,
};
use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Raw bytes retrieved from the device plus the number of whole events in
/// them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawEventBuffer {
    data: Vec<u8>,
    event_count: u32,
}

impl RawEventBuffer {
    pub fn new(data: Vec<u8>, event_count: u32) -> Self {
        Self { data, event_count }
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(bytes),
            event_count: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0 && self.data.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Appends `other` after the events already held, keeping capture order.
    pub fn append(&mut self, mut other: RawEventBuffer) {
        self.data.append(&mut other.data);
        self.event_count += other.event_count;
    }

    /// Drops all data but keeps the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.event_count = 0;
    }
}

/// Primitives consumed from the hardware access layer.
pub trait DigitizerDevice {
    fn open(kind: ConnectionKind, model: DigitizerModel, link: LinkParams) -> Result<Self, ReturnCode>
    where
        Self: Sized;

    fn model(&self) -> DigitizerModel;

    fn board_info(&mut self) -> Result<BoardInfo, ReturnCode>;

    /// Returns every register to its power-on default.
    fn reset(&mut self) -> Result<(), ReturnCode>;

    fn write_global_config(&mut self, config: &GlobalConfig) -> Result<(), ReturnCode>;

    fn write_group_config(&mut self, group: usize, config: &GroupConfig) -> Result<(), ReturnCode>;

    /// May fail with [`ReturnCode::NotYetImplemented`] when the device
    /// cannot report its settings.
    fn read_global_config(&mut self) -> Result<GlobalConfig, ReturnCode>;

    fn read_group_config(&mut self, group: usize) -> Result<GroupConfig, ReturnCode>;

    /// Allocates the device buffers, clears them and starts the run.
    fn arm_acquisition(&mut self) -> Result<(), ReturnCode>;

    fn disarm_acquisition(&mut self) -> Result<(), ReturnCode>;

    fn issue_software_trigger(&mut self) -> Result<(), ReturnCode>;

    /// Point-in-time count of complete events held by the device.
    fn pending_event_count(&mut self) -> Result<u32, ReturnCode>;

    /// Moves up to `max_count` events out of the device, oldest first.
    /// Never waits for events that have not been captured yet.
    fn read_raw_events(&mut self, max_count: u32) -> Result<RawEventBuffer, ReturnCode>;

    /// Discards every event held by the device.
    fn clear_data(&mut self) -> Result<(), ReturnCode>;

    /// Triggers dropped or overwritten because the buffer was full.
    fn lost_trigger_count(&mut self) -> Result<u64, ReturnCode> {
        Err(ReturnCode::NotYetImplemented)
    }

    fn close(&mut self) -> Result<(), ReturnCode>;
}

fn open_links() -> &'static Mutex<HashSet<LinkId>> {
    static OPEN_LINKS: OnceLock<Mutex<HashSet<LinkId>>> = OnceLock::new();
    OPEN_LINKS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive, self-closing ownership of one opened device.
///
/// Only one `Connection` per physical link can exist in the process. After a
/// hard device error the connection is faulted: later calls fail with the
/// same code without reaching the device, until it is dropped and reopened.
pub struct Connection<D: DigitizerDevice> {
    device: D,
    kind: ConnectionKind,
    link: LinkParams,
    link_id: LinkId,
    fault: Option<ReturnCode>,
    closed: bool,
}

impl<D: DigitizerDevice> Connection<D> {
    pub fn open(kind: ConnectionKind, model: DigitizerModel, link: LinkParams) -> Result<Self> {
        let link_id = link.link_id(kind);
        {
            let mut links = open_links().lock().map_err(|_| DigitizerError::Device {
                operation: "open",
                code: ReturnCode::GenericError,
            })?;
            if !links.insert(link_id) {
                warn!(
                    "Link {} (conet node {}, VME {:#x}) is already in use",
                    link.link_number, link.conet_node, link.vme_base_address
                );
                return Err(DigitizerError::Device {
                    operation: "open",
                    code: ReturnCode::DigitizerAlreadyOpen,
                });
            }
        }

        match D::open(kind, model, link) {
            Ok(device) => {
                info!(
                    "Connected {model} over {kind:?} with link number {}, conet node {} and VME address {:#x}",
                    link.link_number, link.conet_node, link.vme_base_address
                );
                Ok(Self {
                    device,
                    kind,
                    link,
                    link_id,
                    fault: None,
                    closed: false,
                })
            }
            Err(code) => {
                release_link(link_id);
                error!("Failed to open {model} on link {}: {code}", link.link_number);
                Err(DigitizerError::Device {
                    operation: "open",
                    code,
                })
            }
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn link(&self) -> LinkParams {
        self.link
    }

    pub fn model(&self) -> DigitizerModel {
        self.device.model()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_some()
    }

    pub fn fault(&self) -> Option<ReturnCode> {
        self.fault
    }

    /// Runs one device primitive, translating and logging its failure.
    pub fn call<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut D) -> Result<T, ReturnCode>,
    ) -> Result<T> {
        if let Some(code) = self.fault {
            return Err(DigitizerError::Device { operation, code });
        }
        f(&mut self.device).map_err(|code| {
            if code.is_warning() {
                warn!("Warning in `{operation}`: {code}");
            } else {
                error!("Error in `{operation}`: {code}");
                self.fault = Some(code);
            }
            DigitizerError::Device { operation, code }
        })
    }

    /// Like [`Connection::call`] but an unsupported primitive yields `None`
    /// instead of an error.
    pub fn call_optional<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut D) -> Result<T, ReturnCode>,
    ) -> Result<Option<T>> {
        if let Some(code) = self.fault {
            return Err(DigitizerError::Device { operation, code });
        }
        match f(&mut self.device) {
            Ok(value) => Ok(Some(value)),
            Err(code) if code.is_unsupported() => Ok(None),
            Err(code) => {
                error!("Error in `{operation}`: {code}");
                self.fault = Some(code);
                Err(DigitizerError::Device { operation, code })
            }
        }
    }

    /// Direct access for device-specific extras (e.g. simulator controls).
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Closes the device now and reports the outcome.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    pub(crate) fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing link {}", self.link.link_number);
        let res = self.device.close();
        release_link(self.link_id);
        res.map_err(|code| DigitizerError::Device {
            operation: "close",
            code,
        })
    }
}

impl<D: DigitizerDevice> Drop for Connection<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to close link {}: {e}", self.link.link_number);
        }
    }
}

fn release_link(link_id: LinkId) {
    match open_links().lock() {
        Ok(mut links) => {
            links.remove(&link_id);
        }
        Err(_) => error!("Connection registry poisoned, {link_id} not released"),
    }
}
