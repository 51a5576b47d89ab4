//! Sample level helpers shared by the relay tap and the finalize pipeline.

pub mod decode;
pub mod mix;
pub mod raw;

pub use api::wav::StreamFormat;
