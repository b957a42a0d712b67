//! # Reel Core
//!
//! Streaming MP4 playback pipeline: bytes in, painted frames out.
//!
//! ```text
//! ByteSource → Mp4Parser → SampleSource → PullDemuxer → VideoRenderer ⇄ VideoDecoder
//!                                                            │
//!                                              render tick → paint (Surface)
//! ```

// ============================================================================
// Configuration / Protocol
// ============================================================================
pub mod config;
pub mod protocol;

// ============================================================================
// Input
// ============================================================================
pub mod source;
pub mod mp4_demux;
pub mod sample_source;
pub mod demuxer;

// ============================================================================
// Decoding
// ============================================================================
pub mod h264_utils;
pub mod decode;
pub mod frame_queue;

// ============================================================================
// Presentation
// ============================================================================
pub mod pixel_convert;
pub mod render;
pub mod detection;
pub mod video_renderer;
pub mod sync;

// ============================================================================
// Media Worker
// ============================================================================
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::PlayerConfig;
pub use protocol::{WorkerCommand, WorkerEvent};
pub use render::SharedSurface;
pub use worker::{spawn, WorkerHandle};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
