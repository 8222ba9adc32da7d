// Library exports for testing
pub mod audio;
pub mod config;
pub mod constants;
pub mod conversion;
pub mod estimate;
pub mod playback;
pub mod segment_worker;
pub mod segmenter;
pub mod synthesis;
pub mod voice;
