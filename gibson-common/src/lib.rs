// gibson-common - Wire protocol definitions and codec for the Gibson cache
//
// This crate is I/O-free: it knows how to build command frames and how to
// turn reply bytes back into values, nothing more.

pub mod codec;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use codec::*;
pub use error::*;
pub use protocol::*;
pub use types::*;
