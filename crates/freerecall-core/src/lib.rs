//! Free-recall event alignment and recall-transition analysis.
//!
//! Raw study and recall trials are merged into one row per item occurrence by
//! [`align`], recall sequences are walked by [`TransitionMasker`], and lag
//! statistics are accumulated per subject by [`lag_crp_by_subject`].
//! Distance-based transition statistics take a [`DistanceMatrix`] indexed by
//! an item-index column of the aligned table.

mod align;
mod batch;
mod distance;
mod lag;
mod stats;
mod table;
mod transitions;

pub use align::{align, AlignOptions};
pub use batch::{
    lag_crp_by_subject, lag_crp_by_subject_with, recall_sequences, AlignedEvent, Execution,
    LagCrpOptions, LagMethod, SubjectLagCrp, SubjectSequences,
};
pub use distance::{
    distance_crp_by_subject, DistanceBin, DistanceCounts, DistanceCrpOptions, DistanceMatrix,
    SubjectDistanceCrp,
};
pub use lag::{lag_crp, LagBin, LagCounts, ListMasks};
pub use stats::{distance_rank, lag_rank, pnr, spc, DistanceRankRow, LagRankRow, PnrRow, SpcRow};
pub use table::{Table, Value};
pub use transitions::{Predicate, Transition, TransitionMasker, Transitions, ValueLookup};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AnalysisError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("data error: {0}")]
    Data(String),
}

/// Column names produced by [`align`] in canonical order, before any
/// caller-supplied passthrough columns.
pub const ALIGNED_COLUMNS: [&str; 5] = ["input", "output", "recalled", "repeat", "intrusion"];
