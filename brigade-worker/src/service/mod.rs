//! Service layer
//!
//! Services contain the log plumbing of the worker: queueing and
//! coalescing, secret blurring, record signing, and framing subprocess
//! output into lines.

pub mod blur;
pub mod line_reader;
pub mod log_pipeline;
pub mod signer;

pub use blur::SecretBlurrer;
pub use line_reader::forward_lines;
pub use log_pipeline::{LogEntry, LogPipeline, LogPipelineSettings, LogPipelineStats, LogSender};
pub use signer::LogSigner;
