//! Provider-facing sync units for the driftwatch engine.
//!
//! Each unit pairs a paginated remote listing with a pure conversion
//! into canonical records; registration with a
//! [`driftwatch_core::SyncEngine`] does the rest.

pub mod client;
pub mod sources;

pub use client::{ApiClientFactory, ApiConfig};
pub use sources::{DnsRecordUnit, ServerUnit, VolumeUnit};
