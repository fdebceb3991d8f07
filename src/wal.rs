use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 4;
/// No single event comes near this; a header claiming more is corrupt.
const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "event too large"));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Why a frame could not be decoded.
enum Frame {
    /// An intact event and the number of bytes its frame occupied.
    Event(Event, u64),
    /// Clean end of file between frames.
    End,
    /// Truncated or corrupt frame; everything from here on is discarded.
    Damaged,
}

/// `remaining` is the number of unread bytes in the file; a header that claims
/// more than that (or more than any real event) is treated as damage before
/// anything is allocated for it.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Frame> {
    let mut len_buf = [0u8; HEADER_LEN];
    match read_full(reader, &mut len_buf)? {
        0 => return Ok(Frame::End),
        n if n < HEADER_LEN => return Ok(Frame::Damaged),
        _ => {}
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let frame_len = (HEADER_LEN + len + CRC_LEN) as u64;
    if len > MAX_FRAME_PAYLOAD || frame_len > remaining {
        return Ok(Frame::Damaged);
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len {
        return Ok(Frame::Damaged);
    }
    let mut crc_buf = [0u8; CRC_LEN];
    if read_full(reader, &mut crc_buf)? < CRC_LEN {
        return Ok(Frame::Damaged);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Frame::Damaged);
    }
    Ok(match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Frame::Event(event, frame_len),
        Err(_) => Frame::Damaged,
    })
}

/// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Result of reading a log back from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the intact prefix.
    pub valid_len: u64,
    /// Bytes after the last intact frame (crash mid-write or corruption).
    pub discarded_bytes: u64,
}

/// Append-only write-ahead log of engine events.
///
/// Format per entry: `[u32 LE: len][bincode: Event][u32 LE: crc32 of payload]`.
/// A damaged tail must be cut off with `truncate` before appending again,
/// otherwise replay would stop at the damage and skip later frames.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without flushing; `flush_sync` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted event set to a temp file and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = Replay::default();

        loop {
            match read_frame(&mut reader, total.saturating_sub(replay.valid_len))? {
                Frame::Event(event, size) => {
                    replay.valid_len += size;
                    replay.events.push(event);
                }
                Frame::End => break,
                Frame::Damaged => {
                    replay.discarded_bytes = total.saturating_sub(replay.valid_len);
                    break;
                }
            }
        }

        Ok(replay)
    }

    /// Cut the file back to its intact prefix.
    pub fn truncate(path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(len)?;
        file.sync_all()
    }
}
