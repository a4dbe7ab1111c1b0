//! Proof-of-work targets and difficulty retargeting.

pub mod difficulty;
