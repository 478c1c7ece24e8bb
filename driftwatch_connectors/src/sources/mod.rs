pub mod compute;
pub mod dns;

pub use compute::{ServerUnit, VolumeUnit};
pub use dns::DnsRecordUnit;
