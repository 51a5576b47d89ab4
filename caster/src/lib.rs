//! Operator side of onair: capture and stream audio to the station, cue
//! artist tracks as markers, watch the recording budget, follow finalize
//! progress and push large files through chunked transfer.

pub mod backoff;
pub mod budget;
pub mod capture;
pub mod client;
pub mod link;
pub mod progress;
pub mod trigger;
pub mod upload;

pub use backoff::Backoff;
pub use client::{ApiError, Client, Credentials};
