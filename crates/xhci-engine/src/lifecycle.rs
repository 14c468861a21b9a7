//! Controller lifecycle: reset, run and halt, plus health checks.

use tracing::{debug, error, info, warn};

use crate::config::PollBudget;
use crate::error::{Result, XhciError};
use crate::hal::{Clock, RegisterIo};
use crate::regs::{Registers, UsbCmd, UsbSts};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Reset in progress (or never completed).
    Reset,
    Stopped,
    Running,
    /// The controller set HCHalted on its own while it was expected to run.
    Halted,
    /// A lifecycle transition timed out or the controller reported HCE/HSE.
    Error,
}

/// Polls `cond` until it returns `true` or `budget` is exhausted.
///
/// `cond` is evaluated at most `budget.max_polls` times; [`Clock::relax`] runs between
/// evaluations. Returns whether the condition was met.
pub fn poll_until<C, F>(clock: &mut C, budget: PollBudget, mut cond: F) -> bool
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let start = clock.now();
    for _ in 0..budget.max_polls {
        if cond() {
            return true;
        }
        if let Some(timeout) = budget.timeout {
            if clock.now().saturating_sub(start) >= timeout {
                return false;
            }
        }
        clock.relax();
    }
    false
}

#[derive(Debug)]
pub struct Lifecycle {
    state: ControllerState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub const fn new() -> Self {
        Self {
            state: ControllerState::Reset,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    fn fail(&mut self, err: XhciError) -> XhciError {
        self.state = ControllerState::Error;
        err
    }

    /// Resets the controller: waits for CNR to clear, halts it if running, sets HCRST and waits
    /// for the reset to self-clear.
    pub fn reset<R, C>(
        &mut self,
        regs: &mut Registers<R>,
        clock: &mut C,
        budget: PollBudget,
    ) -> Result<()>
    where
        R: RegisterIo,
        C: Clock + ?Sized,
    {
        self.state = ControllerState::Reset;

        if !poll_until(clock, budget, || !regs.usbsts().contains(UsbSts::CNR)) {
            warn!("controller not ready before reset");
            return Err(self.fail(XhciError::ResetTimeout));
        }

        if !regs.usbsts().contains(UsbSts::HCH) {
            debug!("halting running controller before reset");
            let cmd = regs.usbcmd() - UsbCmd::RUN_STOP;
            regs.write_usbcmd(cmd);
            if !poll_until(clock, budget, || regs.usbsts().contains(UsbSts::HCH)) {
                warn!("controller did not halt before reset");
                return Err(self.fail(XhciError::ResetTimeout));
            }
        }

        self.assert_reset(regs, clock, budget)
    }

    /// Sets HCRST without waiting for HCHalted first; for a controller that ignored a cleared
    /// Run/Stop.
    pub fn force_reset<R, C>(
        &mut self,
        regs: &mut Registers<R>,
        clock: &mut C,
        budget: PollBudget,
    ) -> Result<()>
    where
        R: RegisterIo,
        C: Clock + ?Sized,
    {
        self.state = ControllerState::Reset;
        self.assert_reset(regs, clock, budget)
    }

    fn assert_reset<R, C>(
        &mut self,
        regs: &mut Registers<R>,
        clock: &mut C,
        budget: PollBudget,
    ) -> Result<()>
    where
        R: RegisterIo,
        C: Clock + ?Sized,
    {
        regs.write_usbcmd(UsbCmd::HCRST);
        if !poll_until(clock, budget, || !regs.usbcmd().contains(UsbCmd::HCRST)) {
            warn!(max_polls = budget.max_polls, "HCRST did not self-clear");
            return Err(self.fail(XhciError::ResetTimeout));
        }
        if !poll_until(clock, budget, || !regs.usbsts().contains(UsbSts::CNR)) {
            warn!("controller not ready after reset");
            return Err(self.fail(XhciError::ResetTimeout));
        }

        self.state = ControllerState::Stopped;
        info!("xhci controller reset");
        Ok(())
    }

    pub fn start<R, C>(
        &mut self,
        regs: &mut Registers<R>,
        clock: &mut C,
        budget: PollBudget,
    ) -> Result<()>
    where
        R: RegisterIo,
        C: Clock + ?Sized,
    {
        let cmd = regs.usbcmd() | UsbCmd::RUN_STOP;
        regs.write_usbcmd(cmd);
        if !poll_until(clock, budget, || !regs.usbsts().contains(UsbSts::HCH)) {
            warn!("controller stayed halted after run");
            return Err(self.fail(XhciError::StartTimeout));
        }
        self.state = ControllerState::Running;
        info!("xhci controller running");
        Ok(())
    }

    pub fn stop<R, C>(
        &mut self,
        regs: &mut Registers<R>,
        clock: &mut C,
        budget: PollBudget,
    ) -> Result<()>
    where
        R: RegisterIo,
        C: Clock + ?Sized,
    {
        let cmd = regs.usbcmd() - UsbCmd::RUN_STOP;
        regs.write_usbcmd(cmd);
        if !poll_until(clock, budget, || regs.usbsts().contains(UsbSts::HCH)) {
            warn!("controller did not halt after stop");
            return Err(self.fail(XhciError::StopTimeout));
        }
        self.state = ControllerState::Stopped;
        info!("xhci controller stopped");
        Ok(())
    }

    /// Checks USBSTS for fatal errors and unexpected halts.
    pub fn check_health<R: RegisterIo>(&mut self, regs: &Registers<R>) -> Result<()> {
        let sts = regs.usbsts();
        if sts.intersects(UsbSts::HCE | UsbSts::HSE) {
            error!(usbsts = sts.bits(), "host controller error");
            return Err(self.fail(XhciError::HostControllerError(sts.bits())));
        }
        if self.state == ControllerState::Running && sts.contains(UsbSts::HCH) {
            warn!(usbsts = sts.bits(), "controller halted unexpectedly");
            self.state = ControllerState::Halted;
            return Err(XhciError::NotRunning(ControllerState::Halted));
        }
        Ok(())
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.state {
            ControllerState::Running => Ok(()),
            other => Err(XhciError::NotRunning(other)),
        }
    }
}
