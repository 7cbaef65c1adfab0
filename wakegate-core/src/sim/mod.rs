//! In-process collaborators for the simulator and the tests: a loopback
//! capture path and a JSON model library.

pub mod capture;
pub mod model_lib;

pub use capture::{LoopbackBackend, LoopbackCapture, LoopbackDevice, RecordedParam};
pub use model_lib::JsonModelLib;
