//! Callbacks handed to the save hypercall.

use std::thread;

use crate::hypervisor::{DomId, HvmParam, SaveCallbacks, ShutdownReason};
use crate::runtime::XenliteContext;
use crate::runtime::constants::{control, device_model, store as keys};
use crate::suspend::session::SuspendSession;
use crate::xenstore::{XBT_NULL, join};
use xenlite_shared::errors::XenliteError;

/// Which way a suspend request reached the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPath {
    /// Signalled on the bound suspend event channel and acked there.
    EventChannel,
    /// Requested through the control/shutdown key and polled for.
    ControlKey(PollOutcome),
}

/// Outcome of the fallback poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The hypervisor reported a suspend shutdown after this many polls.
    Suspended { polls: u32 },
    /// The guest cleared or changed the control key after this many polls.
    KeyChanged { polls: u32 },
    /// The watchdog expired with the key still reading "suspend".
    WatchdogExpired,
}

/// State shared between the save hypercall and the suspend handshake.
pub struct SuspendCallbacks<'a> {
    ctx: &'a XenliteContext,
    session: &'a mut SuspendSession,
    failure: Option<XenliteError>,
    path: Option<SuspendPath>,
}

impl<'a> SuspendCallbacks<'a> {
    pub fn new(ctx: &'a XenliteContext, session: &'a mut SuspendSession) -> Self {
        Self {
            ctx,
            session,
            failure: None,
            path: None,
        }
    }

    /// How the most recent suspend request completed, if one did.
    pub fn path(&self) -> Option<SuspendPath> {
        self.path
    }

    /// Fatal fast-path failure recorded during the save, if any.
    pub fn take_failure(&mut self) -> Option<XenliteError> {
        self.failure.take()
    }

    fn domid(&self) -> DomId {
        self.session.domid()
    }

    /// HVM param read where a failure counts as zero.
    fn hvm_param_or_zero(&self, param: HvmParam) -> u64 {
        match self.ctx.hypervisor().get_hvm_param(self.domid(), param) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(domid = self.domid(), ?param, error = %e, "hvm param read failed");
                0
            }
        }
    }

    /// Signal the bound channel and wait for the guest's ack.
    fn suspend_via_event_channel(&mut self, port: u32) -> bool {
        let domid = self.domid();

        if let Err(e) = self.session.handle().notify(port) {
            tracing::error!(domid, port, error = %e, "suspend event channel notify failed");
            self.failure = Some(XenliteError::Suspend(format!(
                "domain {domid}: notify on port {port} failed: {e}"
            )));
            return false;
        }
        if let Err(e) = self.session.handle().await_suspend(port) {
            tracing::error!(domid, port, error = %e, "awaiting suspend ack failed");
            self.failure = Some(XenliteError::Suspend(format!(
                "domain {domid}: await suspend on port {port} failed: {e}"
            )));
            return false;
        }

        tracing::debug!(domid, port, "guest acknowledged suspend");
        self.path = Some(SuspendPath::EventChannel);
        true
    }

    /// Ask through the control key, nudge the hypervisor for guests without
    /// PV suspend support, then poll until the guest is down or the
    /// watchdog expires.
    fn suspend_via_control_key(&mut self) -> bool {
        let domid = self.domid();

        let store = self.ctx.store();
        let path = match store.get_domain_path(domid) {
            Ok(dom_path) => join(&dom_path, keys::CONTROL_SHUTDOWN),
            Err(e) => {
                tracing::error!(domid, error = %e, "cannot resolve domain path");
                self.failure = Some(e);
                return false;
            }
        };

        if let Err(e) = store.write(XBT_NULL, &path, control::SUSPEND) {
            tracing::warn!(domid, path = %path, error = %e, "failed to write suspend request");
        }

        if self.session.is_hvm() {
            let pv_callback = self.hvm_param_or_zero(HvmParam::CallbackIrq);
            let s_state = self.hvm_param_or_zero(HvmParam::AcpiSState);
            if pv_callback == 0 || s_state != 0 {
                tracing::debug!(domid, pv_callback, s_state, "calling domain shutdown on the domain");
                if let Err(e) = self
                    .ctx
                    .hypervisor()
                    .domain_shutdown(domid, ShutdownReason::Suspend)
                {
                    tracing::warn!(domid, error = %e, "hypervisor suspend shutdown request failed");
                }
            }
        }

        tracing::debug!(domid, "wait for the guest to suspend");
        let outcome = self.poll_for_suspend(&path);
        self.path = Some(SuspendPath::ControlKey(outcome));

        if outcome == PollOutcome::WatchdogExpired {
            // Completion is still reported: the save proceeds unconfirmed.
            tracing::error!(domid, "guest didn't suspend in time");
            if let Err(e) = store.write(XBT_NULL, &path, "") {
                tracing::warn!(domid, path = %path, error = %e, "failed to clear suspend request");
            }
        }
        true
    }

    fn poll_for_suspend(&self, path: &str) -> PollOutcome {
        let domid = self.domid();
        let opts = &self.ctx.options().suspend;
        let interval = opts.poll_interval();
        let store = self.ctx.store();

        let mut state = Some(control::SUSPEND.to_string());
        let mut polls = 0u32;
        while state.as_deref() == Some(control::SUSPEND) && polls < opts.watchdog_attempts {
            if !interval.is_zero() {
                thread::sleep(interval);
            }
            polls += 1;

            match self.ctx.hypervisor().domain_info(domid) {
                Ok(info)
                    if info.domid == domid
                        && info.shutdown_reason() == Some(ShutdownReason::Suspend) =>
                {
                    tracing::debug!(domid, polls, "domain reported suspend shutdown");
                    return PollOutcome::Suspended { polls };
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(domid, error = %e, "domain info query failed"),
            }

            state = match store.read(XBT_NULL, path) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(domid, path = %path, error = %e, "control key read failed");
                    None
                }
            };
        }

        if state.as_deref() == Some(control::SUSPEND) {
            PollOutcome::WatchdogExpired
        } else {
            PollOutcome::KeyChanged { polls }
        }
    }
}

impl SaveCallbacks for SuspendCallbacks<'_> {
    fn suspend(&mut self) -> bool {
        let s_state = if self.session.is_hvm() {
            self.hvm_param_or_zero(HvmParam::AcpiSState)
        } else {
            0
        };

        match self.session.suspend_port() {
            Some(port) if s_state == 0 => self.suspend_via_event_channel(port),
            _ => self.suspend_via_control_key(),
        }
    }

    fn switch_logdirty(&mut self, domid: DomId, enable: bool) {
        let path = device_model::logdirty_cmd_path(domid);
        let cmd = if enable {
            device_model::LOGDIRTY_ENABLE
        } else {
            device_model::LOGDIRTY_DISABLE
        };
        tracing::debug!(domid, cmd, "switching device model log-dirty mode");
        if let Err(e) = self.ctx.store().write(XBT_NULL, &path, cmd) {
            tracing::warn!(domid, path = %path, error = %e, "failed to switch log-dirty mode");
        }
    }
}
