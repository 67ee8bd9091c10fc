//! Live-suspend coordination.
//!
//! ## Protocol
//!
//! ```text
//! open handle ──→ negotiate suspend channel ──→ domain_save ──→ teardown
//!   (fatal if        (warn + fall back if          │
//!    unavailable)     missing/unbindable)           ▼
//!                                          suspend callback:
//!                          bound channel, S-state 0 ─→ notify + await ack
//!                          otherwise ──────────────→ control/shutdown key,
//!                                                    hypervisor shutdown for
//!                                                    HVM without PV callback,
//!                                                    bounded poll (watchdog)
//! ```
//!
//! Fast-path notify/ack failures fail the attempt. Watchdog expiry is logged,
//! the control key is cleared and the save still proceeds.

mod callbacks;
mod session;

use std::io::Write;

use crate::hypervisor::{DomId, SaveFlags};
use crate::runtime::XenliteContext;
use xenlite_shared::errors::XenliteResult;

pub use callbacks::{PollOutcome, SuspendCallbacks, SuspendPath};
pub use session::SuspendSession;

/// Quiesce a running domain and stream its state into `sink`.
///
/// Returns how the guest was asked to suspend, or `None` when the save never
/// requested it. The event channel handle and any negotiated suspend channel
/// are released before returning, on success and failure alike.
pub fn suspend_domain(
    ctx: &XenliteContext,
    domid: DomId,
    sink: &mut dyn Write,
    hvm: bool,
    live: bool,
    debug: bool,
) -> XenliteResult<Option<SuspendPath>> {
    let flags = SaveFlags::compose(live, debug, hvm);
    let mut session = SuspendSession::open(ctx, domid, hvm)?;
    tracing::info!(
        domid,
        ?flags,
        fast_path = session.suspend_port().is_some(),
        "suspending domain"
    );

    let result = {
        let mut callbacks = SuspendCallbacks::new(ctx, &mut session);
        let saved = ctx
            .hypervisor()
            .domain_save(domid, sink, flags, &mut callbacks);
        match callbacks.take_failure() {
            Some(failure) => Err(failure),
            None => saved.map(|()| callbacks.path()),
        }
    };
    drop(session);

    match &result {
        Ok(path) => tracing::info!(domid, ?path, "domain state saved"),
        Err(e) => tracing::error!(domid, error = %e, "domain suspend failed"),
    }
    result
}
