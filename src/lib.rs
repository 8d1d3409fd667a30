pub mod config;
pub mod error;
pub mod matcher;
pub mod query;
pub mod session;
pub mod storage;

pub use error::MatchError;
pub use matcher::{match_all, match_face, Candidate, MatchResult, DEFAULT_THRESHOLD};
pub use storage::{FaceRecord, FaceStore};

// Re-export vision types for convenience
pub use facematch_vision::{video, Camera, Detection, FaceSample, Pipeline};
