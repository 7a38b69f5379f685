use crate::{Connection, DigitizerDevice, DigitizerError, Result};
use log::{info, warn};
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum AcquisitionState {
    #[default]
    Disarmed,
    Armed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disarmed => f.write_str("disarmed"),
            Self::Armed => f.write_str("armed"),
        }
    }
}

/// Arm/disarm state machine of one device.
///
/// The controller never overlaps device calls: every transition is a single
/// primitive issued through the caller's [`Connection`].
#[derive(Debug, Default)]
pub struct AcquisitionController {
    state: AcquisitionState,
}

impl AcquisitionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state == AcquisitionState::Armed
    }

    /// Fails with [`DigitizerError::InvalidState`] unless disarmed.
    pub fn require_disarmed(&self, operation: &'static str) -> Result<()> {
        match self.state {
            AcquisitionState::Disarmed => Ok(()),
            state => Err(DigitizerError::InvalidState { operation, state }),
        }
    }

    /// Disarmed -> Armed. The device allocates and clears its buffers.
    pub fn arm<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>) -> Result<()> {
        self.require_disarmed("arm")?;
        conn.call("arm", |d| d.arm_acquisition())?;
        self.state = AcquisitionState::Armed;
        info!("Acquisition armed");
        Ok(())
    }

    /// Armed -> Disarmed. A no-op when already disarmed.
    ///
    /// On a faulted connection the device is not touched and the transition
    /// is purely local.
    pub fn disarm<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>) -> Result<()> {
        if self.state == AcquisitionState::Disarmed {
            return Ok(());
        }
        if let Some(code) = conn.fault() {
            warn!("Connection faulted ({code}), disarming without device access");
            self.state = AcquisitionState::Disarmed;
            return Ok(());
        }
        conn.call("disarm", |d| d.disarm_acquisition())?;
        self.state = AcquisitionState::Disarmed;
        info!("Acquisition disarmed");
        Ok(())
    }

    /// Asks the device to capture one event now.
    pub fn software_trigger<D: DigitizerDevice>(&mut self, conn: &mut Connection<D>) -> Result<()> {
        if self.state != AcquisitionState::Armed {
            return Err(DigitizerError::InvalidState {
                operation: "software_trigger",
                state: self.state,
            });
        }
        conn.call("software_trigger", |d| d.issue_software_trigger())
    }

    /// Forces the local state after a device reset.
    pub(crate) fn reset(&mut self) {
        self.state = AcquisitionState::Disarmed;
    }
}
