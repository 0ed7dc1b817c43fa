//! The recorder: one shared event stream rotated into chunks and attributed to
//! every running recording

mod engine;
mod handle;
mod periodic;

pub use engine::Recorder;
pub use handle::Recording;
