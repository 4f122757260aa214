//! Serialization primitives.
//!
//! - `encoding`: `Encode`/`Decode` traits used by module images and the
//!   `BinaryCodec` derive

pub mod encoding;
