//! Domain build orchestration and its configuration types.

pub mod build;
pub mod retry;
pub mod types;

pub use build::{
    build_domain, build_hvm, build_post, build_pre, build_pv, publication_entries,
    restore_common, vcpu_availability,
};
pub use retry::{Backoff, RetryPolicy, retry_on_conflict};
pub use types::{BuildInfo, BuildState, ExtraEntries, GuestBuildInfo, GuestType, HvmBuildInfo, PvBuildInfo};
