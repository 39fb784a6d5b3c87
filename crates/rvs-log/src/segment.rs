//! Segment files and record framing.
//!
//! On-disk format of one record:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload]
//! ```
//!
//! Segments are named `<id:020>.log`; ids only ever increase, so the
//! newest segment is the one being appended to.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{LogError, LogResult};

/// Header size: 4 bytes length + 4 bytes CRC.
pub const HEADER_SIZE: usize = 8;

const EXTENSION: &str = "log";

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{EXTENSION}"))
}

/// Segment id encoded in a file name, if it is a segment at all.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".log")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Ids of every segment in `dir`, ascending.
pub fn list_segments(dir: &Path) -> io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = parse_segment_name(&entry.file_name().to_string_lossy()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read and CRC-check the record at `offset`.
pub fn read_frame_at(file: &mut File, segment: u64, offset: u64) -> LogResult<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    let (length, expected) = parse_header(&header);
    let mut payload = vec![0u8; length as usize];
    file.read_exact(&mut payload)?;
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(LogError::Corrupt {
            segment,
            offset,
            reason: format!("CRC mismatch: expected {expected:#010x}, got {actual:#010x}"),
        });
    }
    Ok(payload)
}

fn parse_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (length, crc)
}

/// One well-framed record.
#[derive(Debug)]
pub struct Frame {
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Sequential reader over the records of one segment.
///
/// A record whose CRC fails but whose length is plausible is reported as
/// an error and skipped. A record that runs past the end of the file, or
/// a CRC failure on the final record, is a torn tail: iteration stops and
/// [`FrameReader::valid_len`] marks where it begins.
pub struct FrameReader {
    reader: BufReader<File>,
    segment: u64,
    offset: u64,
    file_len: u64,
    valid_len: u64,
    torn: bool,
    done: bool,
}

impl FrameReader {
    pub fn open(path: &Path, segment: u64, start: u64) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            reader: BufReader::new(file),
            segment,
            offset: start,
            file_len,
            valid_len: start,
            torn: false,
            done: start >= file_len,
        })
    }

    /// End of the last record whose framing was intact.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Whether iteration stopped at an incomplete or torn record.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    fn stop_torn(&mut self, reason: String) -> LogError {
        self.done = true;
        self.torn = true;
        LogError::TornTail {
            segment: self.segment,
            offset: self.offset,
            reason,
        }
    }

    fn read_next(&mut self) -> LogResult<Frame> {
        let offset = self.offset;
        if offset + HEADER_SIZE as u64 > self.file_len {
            return Err(self.stop_torn(format!(
                "{} trailing bytes, shorter than a record header",
                self.file_len - offset
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let (length, expected) = parse_header(&header);
        let end = offset + HEADER_SIZE as u64 + length as u64;
        if length == 0 || end > self.file_len {
            return Err(self.stop_torn(format!(
                "record length {length} runs past end of segment ({})",
                self.file_len
            )));
        }

        let mut payload = vec![0u8; length as usize];
        self.reader.read_exact(&mut payload)?;
        let actual = crc32fast::hash(&payload);
        if actual != expected {
            if end == self.file_len {
                return Err(self.stop_torn("CRC mismatch on final record".into()));
            }
            self.offset = end;
            self.valid_len = end;
            return Err(LogError::Corrupt {
                segment: self.segment,
                offset,
                reason: format!("CRC mismatch: expected {expected:#010x}, got {actual:#010x}"),
            });
        }

        self.offset = end;
        self.valid_len = end;
        self.done = end >= self.file_len;
        Ok(Frame { offset, payload })
    }
}

impl Iterator for FrameReader {
    type Item = LogResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.read_next();
        if let Err(LogError::Io(_)) = &item {
            self.done = true;
        }
        if self.offset >= self.file_len {
            self.done = true;
        }
        Some(item)
    }
}
