//! Incremental reader for the shared OpenVPN log file
//!
//! The helper appends to a log file that we do not own. [`LogCursor`] remembers
//! which file it was reading (device + inode) and how far it got; if the file
//! was replaced or truncated the cursor starts over from the beginning.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

#[cfg(unix)]
fn file_identity(meta: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &Metadata) -> Option<(u64, u64)> {
    None
}

/// Bytes read by one [`LogCursor::read_new`] call
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    pub bytes: Vec<u8>,
    /// The cursor restarted at offset 0 (rotation or truncation)
    pub rewound: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogCursor {
    identity: Option<(u64, u64)>,
    offset: u64,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Reads everything appended since the last call.
    ///
    /// A missing file is not an error: the helper may not have created it yet.
    pub fn read_new(&mut self, path: &Path) -> io::Result<Chunk> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let rewound = self.offset > 0;
                self.reset();
                return Ok(Chunk {
                    bytes: Vec::new(),
                    rewound,
                });
            }
            Err(e) => return Err(e),
        };

        let meta = file.metadata()?;
        let identity = file_identity(&meta);
        let mut rewound = false;
        if identity != self.identity || meta.len() < self.offset {
            rewound = self.offset > 0;
            self.identity = identity;
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        self.offset += bytes.len() as u64;

        Ok(Chunk { bytes, rewound })
    }
}

/// Line splitter on top of [`LogCursor`]; holds back an unterminated last line.
#[derive(Debug, Default)]
pub struct LogTail {
    cursor: LogCursor,
    pending: Vec<u8>,
}

impl LogTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.cursor.reset();
        self.pending.clear();
    }

    /// Complete lines appended since the last call, without line terminators
    pub fn poll_lines(&mut self, path: &Path) -> io::Result<Vec<String>> {
        let chunk = self.cursor.read_new(path)?;
        if chunk.rewound {
            self.pending.clear();
        }
        self.pending.extend_from_slice(&chunk.bytes);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        Ok(String::from_utf8_lossy(&complete)
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect())
    }
}
