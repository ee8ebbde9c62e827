//! Pipeline driver: the capture/inference loop and the preview consumer
//! that rides the other side of the triple buffer.

pub mod looper;
pub mod previewer;

pub use looper::{Looper, LooperControl};
pub use previewer::{PreviewFrame, Previewer};
