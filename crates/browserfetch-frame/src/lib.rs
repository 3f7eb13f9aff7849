//! Wire framing for browserfetch.
//!
//! Every binary message on a browserfetch connection carries:
//! - a JSON metadata block
//! - optionally, one `0x00` separator byte followed by the raw body verbatim
//!
//! The absence of the separator means "no body", which is distinct from an
//! empty body. JSON text never contains a raw NUL, so the first NUL in a
//! message always marks the boundary.

pub mod codec;
pub mod error;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, SEPARATOR};
pub use error::{FrameError, Result};
