//! Per-attempt suspend session: event channel handle plus negotiated port.

use crate::hypervisor::{DomId, EventChannel, EvtchnPort};
use crate::runtime::XenliteContext;
use crate::runtime::constants::store as keys;
use crate::xenstore::{XBT_NULL, join};
use xenlite_shared::errors::{XenliteError, XenliteResult};

/// Ephemeral state for one suspend attempt.
///
/// The negotiated suspend channel is released and the event channel handle
/// closed when the session is dropped, whatever the outcome of the attempt.
pub struct SuspendSession {
    domid: DomId,
    hvm: bool,
    handle: Box<dyn EventChannel>,
    suspend_port: Option<EvtchnPort>,
}

impl SuspendSession {
    /// Open the event channel handle and negotiate the suspend channel.
    ///
    /// # Errors
    ///
    /// Fails only when the event channel subsystem cannot be opened. A
    /// missing or unbindable suspend port degrades to the control-key path.
    pub fn open(ctx: &XenliteContext, domid: DomId, hvm: bool) -> XenliteResult<Self> {
        let handle = ctx.hypervisor().open_event_channel().map_err(|e| {
            tracing::error!(domid, error = %e, "cannot open event channel handle");
            XenliteError::Suspend(format!("domain {domid}: event channel unavailable: {e}"))
        })?;

        let mut session = Self {
            domid,
            hvm,
            handle,
            suspend_port: None,
        };
        session.negotiate(ctx);
        Ok(session)
    }

    fn negotiate(&mut self, ctx: &XenliteContext) {
        let Some(remote) = read_suspend_port(ctx, self.domid) else {
            tracing::warn!(domid = self.domid, "failed to get the suspend evtchn port");
            return;
        };

        match self.handle.bind_suspend(self.domid, remote) {
            Ok(local) => {
                tracing::debug!(domid = self.domid, remote, local, "suspend event channel bound");
                self.suspend_port = Some(local);
            }
            Err(e) => {
                tracing::warn!(
                    domid = self.domid,
                    remote,
                    error = %e,
                    "suspend event channel initialization failed"
                );
            }
        }
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn is_hvm(&self) -> bool {
        self.hvm
    }

    /// Local suspend port, `None` when negotiation fell back.
    pub fn suspend_port(&self) -> Option<EvtchnPort> {
        self.suspend_port
    }

    pub(crate) fn handle(&mut self) -> &mut dyn EventChannel {
        self.handle.as_mut()
    }
}

impl Drop for SuspendSession {
    fn drop(&mut self) {
        if let Some(port) = self.suspend_port.take() {
            self.handle.release_suspend(port);
        }
        self.handle.close();
        tracing::trace!(domid = self.domid, "suspend session torn down");
    }
}

/// Pre-agreed suspend port published by the guest, if any.
fn read_suspend_port(ctx: &XenliteContext, domid: DomId) -> Option<EvtchnPort> {
    let store = ctx.store();
    let dom_path = store.get_domain_path(domid).ok()?;
    let path = join(&dom_path, keys::SUSPEND_EVENT_CHANNEL);
    match store.read(XBT_NULL, &path) {
        Ok(Some(value)) => value.trim().parse().ok(),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(domid, path = %path, error = %e, "suspend port read failed");
            None
        }
    }
}
