//! Event channel handle used by the suspend handshake.

use super::{DomId, EvtchnPort};
use xenlite_shared::errors::XenliteResult;

/// An open handle to the event channel subsystem.
///
/// Owned exclusively by one suspend attempt.
pub trait EventChannel {
    /// Bind the guest's suspend port, returning the local port.
    fn bind_suspend(&mut self, domid: DomId, remote_port: EvtchnPort) -> XenliteResult<EvtchnPort>;

    /// Signal the guest on a bound local port.
    fn notify(&mut self, local_port: EvtchnPort) -> XenliteResult<()>;

    /// Block until the guest acknowledges on `local_port`.
    fn await_suspend(&mut self, local_port: EvtchnPort) -> XenliteResult<()>;

    /// Release a port obtained from [`EventChannel::bind_suspend`].
    fn release_suspend(&mut self, local_port: EvtchnPort);

    /// Close the handle. Called exactly once.
    fn close(&mut self);
}
