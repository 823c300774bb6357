//! driftwatch-snapshot -- query facade over the inventory snapshot service.
//!
//! One module: [`client`], providing [`SnapshotClient`] (windowed,
//! cached, copy-on-write) and the [`Transport`] seam.

pub mod client;

pub use client::{HttpTransport, SnapshotClient, Transport};
