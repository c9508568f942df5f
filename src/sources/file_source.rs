//! JSON-lines file input.

use crate::core::{decode_line, StreamItem, StreamType};
use crate::sources::stream_source::StreamSource;
use crate::Result;
use log::{info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Reads one JSON object per line, coercing values to the stream's declared
/// field types. End of file, or a `{"__eos__": true}` line, ends the stream.
/// Lines that fail to decode are logged and skipped.
pub struct FileSource {
    stream_type: StreamType,
    path: PathBuf,
    reader: BufReader<File>,
    line_number: usize,
    skipped: u64,
    finished: bool,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P, stream_type: StreamType) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        info!("Reading stream {} from {}", stream_type.name, path.display());

        Ok(FileSource {
            stream_type,
            path,
            reader: BufReader::new(file),
            line_number: 0,
            skipped: 0,
            finished: false,
        })
    }

    /// Lines that could not be decoded so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn finish(&mut self) -> Option<StreamItem> {
        self.finished = true;
        Some(StreamItem::EndOfStream)
    }
}

impl StreamSource for FileSource {
    fn stream_name(&self) -> &str {
        &self.stream_type.name
    }

    fn poll_next(&mut self) -> Result<Option<StreamItem>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = Vec::new();
        loop {
            buf.clear();
            if self.reader.read_until(b'\n', &mut buf)? == 0 {
                return Ok(self.finish());
            }
            self.line_number += 1;

            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    self.skipped += 1;
                    warn!("{}:{}: skipping line: {}", self.path.display(), self.line_number, e);
                    continue;
                }
            };

            match decode_line(line, &self.stream_type) {
                Ok(Some(StreamItem::EndOfStream)) => return Ok(self.finish()),
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => {}
                Err(e) => {
                    self.skipped += 1;
                    warn!("{}:{}: skipping line: {}", self.path.display(), self.line_number, e);
                }
            }
        }
    }
}
