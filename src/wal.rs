//! Append-only schedule journal.
//!
//! Each record is framed as `[u32 LE: len][bincode Event][u32 LE: crc32(payload)]`.
//! A crash can leave a torn record at the tail; replay stops at the first frame
//! that is short or fails its checksum and keeps everything before it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

const LEN_BYTES: usize = 4;
const CRC_BYTES: usize = 4;

fn write_frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "journal record too large"))?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// How reading one frame ended.
enum Frame {
    Record(Vec<u8>),
    /// Clean end of file at a frame boundary.
    End,
    /// Short read inside a frame or checksum mismatch.
    Torn,
}

/// `read_exact`, but an EOF becomes `Ok(false)` instead of an error.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(input: &mut impl Read) -> io::Result<Frame> {
    let mut len = [0u8; LEN_BYTES];
    if !fill(input, &mut len)? {
        return Ok(Frame::End);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
    let mut crc = [0u8; CRC_BYTES];
    if !fill(input, &mut payload)? || !fill(input, &mut crc)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(crc) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    Ok(Frame::Record(payload))
}

pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open for appending, creating the file if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            out: BufWriter::new(append_handle(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Durable append: returns only after the record is fsync'd.
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.out, event)?;
        self.appends_since_compact += 1;
        self.out.flush()?;
        self.out.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Swap the journal for `events`, atomically: the new contents are
    /// written and synced beside the journal, then renamed over it.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let staging = self.path.with_extension("compacting");
        let mut out = BufWriter::new(File::create(&staging)?);
        for event in events {
            write_frame(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&staging, &self.path)?;
        self.out = BufWriter::new(append_handle(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Every intact record in the journal at `path`. A missing file is an
    /// empty journal.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        scan(path).map(|(events, _)| events)
    }

    /// Replay `path`, cut any torn or undecodable tail off the file, then
    /// open it for appending. New records land directly after the last
    /// intact one, so a later replay sees them.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, intact) = scan(path)?;
        match fs::metadata(path) {
            Ok(meta) if meta.len() > intact => {
                warn!(
                    path = %path.display(),
                    discarded_bytes = meta.len() - intact,
                    "truncating journal to last intact record"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(intact)?;
                file.sync_all()?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((Self::open(path)?, events))
    }
}

/// Intact records at `path` and the number of bytes they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut input = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact = 0u64;
    loop {
        match read_frame(&mut input)? {
            Frame::Record(payload) => match bincode::deserialize::<Event>(&payload) {
                Ok(event) => {
                    intact += (LEN_BYTES + payload.len() + CRC_BYTES) as u64;
                    events.push(event);
                }
                Err(e) => {
                    warn!(path = %path.display(), kept = events.len(), "undecodable journal record: {e}");
                    break;
                }
            },
            Frame::End => break,
            Frame::Torn => {
                warn!(path = %path.display(), kept = events.len(), "torn journal tail discarded");
                break;
            }
        }
    }
    Ok((events, intact))
}

fn append_handle(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
