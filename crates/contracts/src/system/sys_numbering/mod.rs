pub mod aggregate;
pub mod dto;

pub use aggregate::{NumberFormat, ResetFrequency, SequenceConfig, SequenceKey, SequenceState};
pub use dto::{CodeRequest, IssuedNumber, SequenceConfigPatch, SequenceSnapshot, SnapshotConfig};
