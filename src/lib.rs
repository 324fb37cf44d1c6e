//! Color filters for movies: presets, their configuration, and the glue that turns
//! a preset into a per-frame adjustment for [`av_reader_writer::Transcoder`].

pub mod config;
pub mod filter;

pub use config::AppConfig;
pub use filter::FilterPreset;
