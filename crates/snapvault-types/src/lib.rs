pub mod checksum;
pub mod error;

pub use checksum::Checksum;
pub use error::{Result, SnapError};
