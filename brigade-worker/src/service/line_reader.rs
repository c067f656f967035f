//! Byte stream to log lines
//!
//! Frames the output of a subprocess into newline-terminated log lines for
//! one step. Invalid UTF-8 is replaced rather than rejected. A line longer
//! than [`MAX_LINE_LENGTH`] is cut into several log lines.

use brigade_core::domain::log::LogLevel;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

use crate::service::log_pipeline::LogSender;

/// Longest line kept in memory before it is forwarded as is
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Forwards every line of `reader` to the log pipeline until end of stream
///
/// A residual partial line at end of stream is flushed as one final line.
/// Returns the number of lines forwarded.
pub async fn forward_lines<R>(reader: R, logs: LogSender, step_order: usize, level: LogLevel) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut count = 0;

    let mut emit = |buf: &mut Vec<u8>| {
        logs.send(step_order, level, String::from_utf8_lossy(buf).into_owned());
        count += 1;
        buf.clear();
    };

    loop {
        let available = match reader.fill_buf().await {
            Ok([]) => break,
            Ok(available) => available,
            Err(e) => {
                warn!("Cannot read output of step {}: {}", step_order, e);
                break;
            }
        };

        let room = MAX_LINE_LENGTH - buf.len();
        let window = &available[..available.len().min(room)];
        let (taken, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), buf.len() + window.len() == MAX_LINE_LENGTH),
        };

        buf.extend_from_slice(&window[..taken]);
        reader.consume(taken);

        if complete {
            emit(&mut buf);
        }
    }

    if !buf.is_empty() {
        emit(&mut buf);
    }

    count
}
