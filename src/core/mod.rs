pub mod checkpoint;
pub mod mutation;

pub use checkpoint::{
    Checkpoint, CheckpointDoc, CheckpointError, NUM_VBUCKETS, SnapshotWindow, Vbts,
};
pub use mutation::{BODY_HASH_LEN, BinnedRecord, Mutation, OpCode, RECORD_FIXED_LEN, RecordError};
