use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::prelude::*;

pub const OUTPUT_TARGET: &str = "gamewatch::output";

/// Bounded in-memory tail of the game's combined stdout and stderr. Appends
/// drop the oldest bytes once the limit is reached; `seal` freezes the buffer
/// so the text delivered with the session outcome never changes afterwards.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    inner: Arc<Mutex<CaptureBuf>>,
}

#[derive(Debug)]
struct CaptureBuf {
    data: Vec<u8>,
    limit: usize,
    sealed: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CaptureBuf {
                data: Vec::new(),
                limit,
                sealed: false,
            })),
        }
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut buf = self.inner.lock().unwrap();
        if buf.sealed {
            return;
        }
        buf.data.extend_from_slice(bytes);
        if buf.data.len() > buf.limit {
            let excess = buf.data.len() - buf.limit;
            buf.data.drain(..excess);
        }
    }

    pub fn seal(&self) {
        self.inner.lock().unwrap().sealed = true;
    }

    pub fn contents(&self) -> String {
        let buf = self.inner.lock().unwrap();
        String::from_utf8_lossy(&buf.data).into_owned()
    }
}

/// Drain one child pipe on a dedicated thread until EOF, feeding the capture
/// and optionally echoing complete lines to the console. Returns the thread
/// handle so the session can join the drain before freezing the capture.
pub(crate) fn spawn_drain(
    reader: impl Read + Send + 'static,
    echo: Option<impl Write + Send + 'static>,
    capture: OutputCapture,
    log_prefix: Option<&'static str>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || drain(reader, echo, &capture, log_prefix))
}

fn drain(
    mut reader: impl Read,
    mut echo: Option<impl Write>,
    capture: &OutputCapture,
    log_prefix: Option<&str>,
) {
    let prefix = log_prefix.unwrap_or("");
    let mut buffer = [0; 1024];
    let mut line_buffer = Vec::new();

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(bytes_read) => bytes_read,
            Err(err) => {
                debug!("game output stream closed: {err}");
                break;
            }
        };

        capture.append(&buffer[..bytes_read]);
        line_buffer.extend_from_slice(&buffer[..bytes_read]);

        // Echo only complete lines (ending with \n or \r), keep the remainder
        if let Some(last_newline_pos) = line_buffer.iter().rposition(|&b| b == b'\n' || b == b'\r')
        {
            let to_flush = &line_buffer[..=last_newline_pos];
            emit(&mut echo, to_flush, prefix);
            line_buffer = line_buffer[last_newline_pos + 1..].to_vec();
        }
    }

    // Flush any remaining data in the line buffer
    if !line_buffer.is_empty() {
        emit(&mut echo, &line_buffer, prefix);
    }
}

fn emit<W: Write>(echo: &mut Option<W>, bytes: &[u8], prefix: &str) {
    if let Some(writer) = echo {
        let written = writer.write_all(bytes).and_then(|()| writer.flush());
        // A dead echo sink must not stop the capture.
        if written.is_err() {
            *echo = None;
        }
    }
    trace!(
        target: OUTPUT_TARGET,
        "{}{}",
        prefix,
        String::from_utf8_lossy(bytes)
    );
}
