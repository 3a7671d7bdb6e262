//! Newline framing for the device channel.
//!
//! Peers are small microcontrollers and anything can arrive on the wire.
//! Lines that are not UTF-8 or exceed [`MAX_LINE_LEN`] are dropped here so a
//! single bad frame never ends a session.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

/// Longest accepted line, excluding the terminator
pub const MAX_LINE_LEN: usize = 256;

pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    // Inside an overlong line, waiting for its terminator
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(MAX_LINE_LEN),
            discarding: false,
        }
    }

    /// Next well-formed line without its `\n` / `\r\n` terminator, or `None`
    /// at end of stream.
    ///
    /// Cancel safe: partially read bytes stay buffered for the next call, so
    /// it can be used as a `tokio::select!` branch.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let budget = (MAX_LINE_LEN + 1).saturating_sub(self.buf.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.buf)
                .await?;

            let terminated = self.buf.last() == Some(&b'\n');

            if self.discarding {
                if read == 0 {
                    self.buf.clear();
                    return Ok(None);
                }
                if terminated {
                    self.discarding = false;
                }
                self.buf.clear();
                continue;
            }

            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }

            if !terminated && read != 0 {
                if self.buf.len() > MAX_LINE_LEN {
                    debug!(limit = MAX_LINE_LEN, "Skipping overlong device line");
                    self.buf.clear();
                    self.discarding = true;
                }
                continue;
            }

            // Either a full line, or the unterminated tail before end of stream
            let mut line = std::mem::take(&mut self.buf);
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            match String::from_utf8(line) {
                Ok(line) => return Ok(Some(line)),
                Err(e) => {
                    debug!(error = %e, "Skipping device line that is not UTF-8");
                    if read == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }
}
