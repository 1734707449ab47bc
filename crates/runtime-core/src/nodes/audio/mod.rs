//! Native audio DSP nodes

pub mod format_convert;
pub mod resample;
pub mod vad;

pub use format_convert::AudioFormatConvertNode;
pub use resample::AudioResampleNode;
pub use vad::EnergyVadNode;
