//! Toolstack context handle.

use std::sync::Arc;

use crate::hypervisor::{Capabilities, DomId, DomainInfo, Hypervisor, ShutdownReason};
use crate::runtime::layout::XenLayout;
use crate::runtime::options::XenliteOptions;
use crate::util::init_logging;
use crate::xenstore::ConfigStore;
use tracing_appender::non_blocking::WorkerGuard;
use xenlite_shared::errors::XenliteResult;

/// Explicit context passed to every toolstack operation.
///
/// Owns the config store connection, the hypervisor handle and, when a log
/// directory is configured, the background log writer. Dropping the context
/// flushes and closes the log sink.
pub struct XenliteContext {
    store: Arc<dyn ConfigStore>,
    hypervisor: Arc<dyn Hypervisor>,
    options: XenliteOptions,
    layout: XenLayout,
    capabilities: Capabilities,
    _log_guard: Option<WorkerGuard>,
}

impl XenliteContext {
    /// Create a context over the given collaborators.
    ///
    /// # Errors
    ///
    /// Returns error if the log directory cannot be created.
    pub fn new(
        store: Arc<dyn ConfigStore>,
        hypervisor: Arc<dyn Hypervisor>,
        options: XenliteOptions,
    ) -> XenliteResult<Self> {
        let log_guard = match &options.log_dir {
            Some(dir) => Some(init_logging(dir)?),
            None => None,
        };

        let layout = XenLayout::new(options.state_dir.clone(), options.firmware_dir.clone());
        let capabilities = Capabilities::resolve(options.cpuid_policy);

        tracing::debug!(
            state_dir = %layout.state_dir().display(),
            firmware_dir = %layout.firmware_dir().display(),
            capabilities = %capabilities.reason,
            "xenlite context initialized"
        );

        Ok(Self {
            store,
            hypervisor,
            options,
            layout,
            capabilities,
            _log_guard: log_guard,
        })
    }

    pub fn store(&self) -> &dyn ConfigStore {
        self.store.as_ref()
    }

    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    pub fn options(&self) -> &XenliteOptions {
        &self.options
    }

    pub fn layout(&self) -> &XenLayout {
        &self.layout
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Current hypervisor view of a domain.
    pub fn domain_info(&self, domid: DomId) -> XenliteResult<DomainInfo> {
        self.hypervisor.domain_info(domid)
    }

    pub fn is_hvm(&self, domid: DomId) -> XenliteResult<bool> {
        Ok(self.domain_info(domid)?.is_hvm())
    }

    /// Shutdown reason, `None` while the domain is still running.
    pub fn shutdown_reason(&self, domid: DomId) -> XenliteResult<Option<ShutdownReason>> {
        Ok(self.domain_info(domid)?.shutdown_reason())
    }
}
