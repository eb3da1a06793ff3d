// API处理器模块

pub mod archive;
pub mod misc;

pub use archive::*;
pub use misc::*;
