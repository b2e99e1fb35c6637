//! Line re-assembly across arbitrary socket fragmentation.

use super::assembler::{Assembled, MessageAssembler};

/// Splits inbound byte chunks into lines and feeds them to a
/// [`MessageAssembler`].
///
/// Bytes, not chars, are carried between chunks so a UTF-8 sequence split by
/// the socket decodes intact. `\n`, `\r` and `\r\n` all terminate a line,
/// including a `\r\n` pair split across two chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    fragment: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet terminated.
    pub fn fragment(&self) -> &[u8] {
        &self.fragment
    }

    /// Consume one chunk, returning every message it completed.
    pub fn feed(&mut self, chunk: &[u8], assembler: &mut MessageAssembler) -> Vec<Assembled> {
        let mut completed = Vec::new();
        let mut start = 0;
        let mut index = 0;

        if self.after_cr && chunk.first() == Some(&b'\n') {
            start = 1;
            index = 1;
        }
        if !chunk.is_empty() {
            self.after_cr = false;
        }

        while index < chunk.len() {
            let ch = chunk[index];
            if ch == b'\n' || ch == b'\r' {
                let line = if self.fragment.is_empty() {
                    String::from_utf8_lossy(&chunk[start..index]).into_owned()
                } else {
                    self.fragment.extend_from_slice(&chunk[start..index]);
                    let joined = String::from_utf8_lossy(&self.fragment).into_owned();
                    self.fragment.clear();
                    joined
                };
                deliver(&line, assembler, &mut completed);

                if ch == b'\r' {
                    match chunk.get(index + 1) {
                        Some(b'\n') => index += 1,
                        None => self.after_cr = true,
                        Some(_) => {}
                    }
                }
                start = index + 1;
            }
            index += 1;
        }

        self.fragment.extend_from_slice(&chunk[start..]);
        completed
    }
}

fn deliver(line: &str, assembler: &mut MessageAssembler, completed: &mut Vec<Assembled>) {
    if line.is_empty() {
        return;
    }
    match assembler.push_line(line) {
        Ok(Some(done)) => completed.push(done),
        Ok(None) => {}
        Err(err) => {
            tracing::debug!(%line, error = %err, "malformed line");
            completed.extend(assembler.fail(err));
        }
    }
}
