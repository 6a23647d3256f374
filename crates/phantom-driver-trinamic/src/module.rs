//! Command layer over a TMCL bus.

use crate::params::{AxisParameter, GlobalParameter};
use crate::tmcl::{move_mode, RfsMode, TmclBus, TmclCommand, TmclReply, TmclRequest, DEVICE};
use phantom_core::error::{PhantomError, PhantomResult};
use tracing::instrument;

/// A TMCM module reachable over one bus.
pub struct TmclModule {
    bus: Box<dyn TmclBus>,
    address: u8,
}

impl TmclModule {
    /// Talk to the module at `address` over `bus`.
    pub fn new(bus: Box<dyn TmclBus>, address: u8) -> Self {
        Self { bus, address }
    }

    /// Module address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Raw instruction. Returns the reply value.
    ///
    /// # Errors
    /// [`PhantomError::Rejected`] if the module answers with an error status.
    pub async fn send(&mut self, command: u8, kind: u8, motor: u8, value: i32) -> PhantomResult<i32> {
        let request = TmclRequest {
            address: self.address,
            command,
            kind,
            motor,
            value,
        };
        let reply: TmclReply = self.bus.transact(request).await?;

        if !reply.status.is_ok() {
            tracing::warn!(request = %request.describe(), status = %reply.status, "TMCL command rejected");
            return Err(PhantomError::Rejected {
                device: DEVICE.to_string(),
                command: request.describe(),
                status: reply.status.to_string(),
            });
        }
        Ok(reply.value)
    }

    async fn command(&mut self, command: TmclCommand, kind: u8, motor: u8, value: i32) -> PhantomResult<i32> {
        self.send(command.number(), kind, motor, value).await
    }

    /// SAP
    #[instrument(skip(self), err)]
    pub async fn set_axis_parameter(&mut self, motor: u8, param: AxisParameter, value: i32) -> PhantomResult<()> {
        self.command(TmclCommand::Sap, param.number(), motor, value).await?;
        Ok(())
    }

    /// GAP
    pub async fn get_axis_parameter(&mut self, motor: u8, param: AxisParameter) -> PhantomResult<i32> {
        self.command(TmclCommand::Gap, param.number(), motor, 0).await
    }

    /// SGP
    #[instrument(skip(self), err)]
    pub async fn set_global_parameter(&mut self, param: GlobalParameter, value: i32) -> PhantomResult<()> {
        self.command(TmclCommand::Sgp, param.number(), param.bank(), value).await?;
        Ok(())
    }

    /// GGP
    pub async fn get_global_parameter(&mut self, param: GlobalParameter) -> PhantomResult<i32> {
        self.command(TmclCommand::Ggp, param.number(), param.bank(), 0).await
    }

    /// Set the positioning speed, then start an absolute move.
    #[instrument(skip(self), err)]
    pub async fn move_to(&mut self, motor: u8, target: i32, velocity: i32) -> PhantomResult<()> {
        self.set_axis_parameter(motor, AxisParameter::MaxVelocity, velocity).await?;
        self.command(TmclCommand::Mvp, move_mode::ABSOLUTE, motor, target).await?;
        Ok(())
    }

    /// MST
    #[instrument(skip(self), err)]
    pub async fn stop(&mut self, motor: u8) -> PhantomResult<()> {
        self.command(TmclCommand::Mst, 0, motor, 0).await?;
        Ok(())
    }

    /// RFS
    #[instrument(skip(self), err)]
    pub async fn reference_search(&mut self, motor: u8, mode: RfsMode) -> PhantomResult<i32> {
        self.command(TmclCommand::Rfs, mode as u8, motor, 0).await
    }

    /// Firmware version as reported in binary form (type 1).
    pub async fn firmware_version(&mut self) -> PhantomResult<i32> {
        self.command(TmclCommand::FirmwareVersion, 1, 0, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTmcm;
    use crate::tmcl::TmclCommand;

    #[tokio::test]
    async fn move_to_sets_velocity_before_mvp() {
        let (bus, handle) = SimulatedTmcm::new(Default::default());
        let mut module = TmclModule::new(Box::new(bus), 1);

        module.move_to(1, 64_000, 500).await.unwrap();

        let requests = handle.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].command, TmclCommand::Sap.number());
        assert_eq!(requests[0].kind, AxisParameter::MaxVelocity.number());
        assert_eq!(requests[0].value, 500);
        assert_eq!(requests[1].command, TmclCommand::Mvp.number());
        assert_eq!(requests[1].motor, 1);
        assert_eq!(requests[1].value, 64_000);
    }

    #[tokio::test]
    async fn global_parameter_round_trip() {
        let (bus, _handle) = SimulatedTmcm::new(Default::default());
        let mut module = TmclModule::new(Box::new(bus), 1);

        module
            .set_global_parameter(GlobalParameter::EndSwitchPolarity, 1)
            .await
            .unwrap();
        assert_eq!(
            module
                .get_global_parameter(GlobalParameter::EndSwitchPolarity)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_instruction_is_rejected() {
        let (bus, _handle) = SimulatedTmcm::new(Default::default());
        let mut module = TmclModule::new(Box::new(bus), 1);

        let err = module.send(200, 0, 0, 0).await.unwrap_err();
        match err {
            PhantomError::Rejected { status, .. } => assert!(status.contains("invalid command")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn firmware_version_is_read() {
        let (bus, _handle) = SimulatedTmcm::new(Default::default());
        let mut module = TmclModule::new(Box::new(bus), 1);
        assert!(module.firmware_version().await.unwrap() > 0);
    }
}
