//! xenlite: the core of a Xen-style toolstack.
//!
//! Builds guest domains (PV and HVM), coordinates live suspend for
//! save/migrate, keeps durable per-domain userdata and captures device model
//! state. The hypervisor and the config store are reached through the
//! [`hypervisor::Hypervisor`] and [`xenstore::ConfigStore`] traits, bundled
//! with options in a [`XenliteContext`].

pub mod device_model;
pub mod domain;
pub mod hypervisor;
pub mod runtime;
pub mod suspend;
pub mod userdata;
pub mod util;
pub mod xenstore;

pub use runtime::XenliteContext;
pub use runtime::options::{SuspendOptions, XenliteOptions};
pub use xenlite_shared::errors::{XenliteError, XenliteResult};
