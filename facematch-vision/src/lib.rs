pub mod align;
pub mod detect;
pub mod encode;
pub mod model;
pub mod pipeline;
pub mod video;

// Re-export commonly used types
pub use detect::Detection;
pub use pipeline::{FaceSample, Pipeline};
pub use video::Camera;
