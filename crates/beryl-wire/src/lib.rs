pub mod error;
pub mod frame;
pub mod segment;

pub use error::{Result, WireError};
pub use frame::{Frame, HANDSHAKE_REQUEST};
pub use segment::{Segment, Segmenter, sha256_hex};
