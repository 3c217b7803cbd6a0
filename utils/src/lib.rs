//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
#[cfg(feature = "fixture")]
mod fixture;
#[cfg(feature = "fixture")]
pub use fixture::*;
mod quote;
pub use quote::*;
mod tracing_util;
pub use tracing_util::*;
