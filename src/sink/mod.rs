//! Append-only dataset sinks.
//!
//! Two JSONL streams, each owned by a single writer:
//!
//! - SFT: one record per scored candidate (`training_data_YYYYMM.jsonl`)
//! - DPO: at most one preference pair per batch (`dpo_data_YYYYMM.jsonl`)

mod jsonl;
mod records;

pub use jsonl::{
    partition_name, JsonlSink, PartitionStats, SinkStats, SyncPolicy, DPO_PREFIX, SFT_PREFIX,
};
pub use records::{DpoMetadata, DpoRecord, DpoSide, SftMetadata, SftRecord, SftVerification};
