//! Rondo Core - Streaming audio playback engine
//!
//! This crate provides the core functionality for audio playback: format
//! probing, ffmpeg-based decoding, the playback session loop, and output
//! to the system audio device.

pub mod engine;
pub mod output;
pub mod player;
pub mod probe;
pub mod source;

pub use engine::SessionEnd;
pub use player::{ AudioBackend, PlaybackState, Player, PlayerError, SystemBackend };
pub use player::{ MAX_SPEED, MAX_VOLUME, MIN_SPEED };
pub use probe::TrackFormat;
