pub mod constants;
pub mod layout;
pub mod options;

mod core;
pub use core::XenliteContext;
