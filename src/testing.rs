//! Fakes shared by the unit tests.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{ReferenceDecoder, ReferenceError};

/// Reference decoder keyed on the first byte: `op -> length`.
///
/// Anything not in the table, or a window too short for the length, is invalid.
#[derive(Debug, Default)]
pub struct ScriptedReference {
    lengths: HashMap<u8, usize>,
    calls: AtomicUsize,
}

impl ScriptedReference {
    pub fn new(table: &[(u8, usize)]) -> Self {
        Self {
            lengths: table.iter().copied().collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ReferenceDecoder for ScriptedReference {
    fn decode_len(&self, bytes: &[u8]) -> Result<usize, ReferenceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let op = *bytes.first().ok_or(ReferenceError::Empty)?;
        match self.lengths.get(&op) {
            Some(&len) if len <= bytes.len() => Ok(len),
            _ => Err(ReferenceError::Invalid(format!("{op:#04x}"))),
        }
    }
}

/// In-memory diagnostic sink that can be read back after the writer moves.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
