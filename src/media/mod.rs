pub mod analysis;
pub mod codecs;
pub mod engine;
pub mod recorder;
pub mod ring;
pub mod sink;
pub mod source;
pub mod vad;
