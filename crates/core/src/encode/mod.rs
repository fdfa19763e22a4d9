//! Encoder command construction for HandForge

pub mod ffmpeg;

pub use ffmpeg::{CommandBuilder, EncodeError, PassSpec};
