//! Command framing: fixed header, then the raw buffers, then the metadata blob.
//!
//! Header layout (native byte order, C struct layout, [`HEADER_LEN`] bytes):
//!
//! ```text
//! offset  field
//! 0       tag          u32  (COMMAND_TAG)
//! 4       kind         u32
//! 8       client_id    i64
//! 16      count        u32  (<= MAX_BUFFERS)
//! 20      padding      4 bytes
//! 24      lengths      u64 x MAX_BUFFERS
//! 2072    meta_len     u64
//! ```
//!
//! There is no resynchronization: after any error the stream must be closed.

use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::data::EdgeData;
use crate::protocol::{CommandKind, COMMAND_TAG, MAX_BUFFERS};

const KIND_OFFSET: usize = 4;
const CLIENT_ID_OFFSET: usize = 8;
const COUNT_OFFSET: usize = 16;
const LENGTHS_OFFSET: usize = 24;
const META_LEN_OFFSET: usize = LENGTHS_OFFSET + MAX_BUFFERS * 8;

/// Size of the fixed command header.
pub const HEADER_LEN: usize = META_LEN_OFFSET + 8;

/// Error writing or reading a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid command tag {0:#010x}")]
    InvalidTag(u32),
    #[error("unknown command kind {0}")]
    UnknownKind(u32),
    #[error("buffer count {0} exceeds {MAX_BUFFERS}")]
    TooManyBuffers(u32),
    #[error("declared length {0} does not fit in memory")]
    OutOfMemory(u64),
}

/// One framed unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub client_id: i64,
    pub buffers: Vec<Bytes>,
    pub metadata: Bytes,
}

impl Command {
    pub fn new(kind: CommandKind, client_id: i64) -> Self {
        Self {
            kind,
            client_id,
            buffers: Vec::new(),
            metadata: Bytes::new(),
        }
    }

    /// Rejection or teardown notice.
    pub fn error(client_id: i64) -> Self {
        Self::new(CommandKind::Error, client_id)
    }

    /// Server greeting: its capability string and the id it assigned to the connection.
    pub fn capability(client_id: i64, caps: &str) -> Self {
        let mut cmd = Self::new(CommandKind::Capability, client_id);
        if !caps.is_empty() {
            cmd.buffers.push(Bytes::copy_from_slice(caps.as_bytes()));
        }
        cmd
    }

    /// Address the peer should connect back to, and optionally the sender's capability.
    pub fn host_info(client_id: i64, host: &str, port: u16, caps: &str) -> Self {
        let mut cmd = Self::new(CommandKind::HostInfo, client_id);
        cmd.buffers.push(Bytes::from(format!("{host}:{port}")));
        if !caps.is_empty() {
            cmd.buffers.push(Bytes::copy_from_slice(caps.as_bytes()));
        }
        cmd
    }

    /// Frame a data object; buffers are shared, not copied.
    pub fn transfer(client_id: i64, data: &EdgeData) -> Self {
        let meta = data.metadata();
        let mut cmd = Self::new(CommandKind::TransferData, client_id);
        cmd.buffers = data.buffers();
        if !meta.is_empty() {
            cmd.metadata = Bytes::from(meta.serialize());
        }
        cmd
    }

    fn text(&self, index: usize) -> Option<String> {
        self.buffers
            .get(index)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Capability string of a CAPABILITY command (empty when none was sent).
    pub fn caps(&self) -> String {
        self.text(0).unwrap_or_default()
    }

    /// `(host, port, caps)` carried by a HOST_INFO command.
    pub fn parse_host_info(&self) -> Option<(String, u16, String)> {
        let addr = self.text(0)?;
        let (host, port) = split_host_port(&addr)?;
        Some((host, port, self.text(1).unwrap_or_default()))
    }

    pub fn encode_header(&self) -> Result<[u8; HEADER_LEN], CommandError> {
        if self.buffers.len() > MAX_BUFFERS {
            return Err(CommandError::TooManyBuffers(self.buffers.len() as u32));
        }
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&COMMAND_TAG.to_ne_bytes());
        header[KIND_OFFSET..KIND_OFFSET + 4].copy_from_slice(&(self.kind as u32).to_ne_bytes());
        header[CLIENT_ID_OFFSET..CLIENT_ID_OFFSET + 8]
            .copy_from_slice(&self.client_id.to_ne_bytes());
        header[COUNT_OFFSET..COUNT_OFFSET + 4]
            .copy_from_slice(&(self.buffers.len() as u32).to_ne_bytes());
        for (i, b) in self.buffers.iter().enumerate() {
            let at = LENGTHS_OFFSET + i * 8;
            header[at..at + 8].copy_from_slice(&(b.len() as u64).to_ne_bytes());
        }
        header[META_LEN_OFFSET..META_LEN_OFFSET + 8]
            .copy_from_slice(&(self.metadata.len() as u64).to_ne_bytes());
        Ok(header)
    }
}

/// Split `"host:port"`, accepting a bracketed IPv6 host.
pub(crate) fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Decoded fixed header; tells the reader how many bytes follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: CommandKind,
    pub client_id: i64,
    pub lengths: Vec<u64>,
    pub meta_len: u64,
}

/// Validate and decode a header. Nothing is allocated for buffers here.
pub fn decode_header(raw: &[u8; HEADER_LEN]) -> Result<Header, CommandError> {
    let tag = u32_at(raw, 0);
    if tag != COMMAND_TAG {
        return Err(CommandError::InvalidTag(tag));
    }
    let kind_raw = u32_at(raw, KIND_OFFSET);
    let kind = CommandKind::from_wire(kind_raw).ok_or(CommandError::UnknownKind(kind_raw))?;
    let count = u32_at(raw, COUNT_OFFSET);
    if count as usize > MAX_BUFFERS {
        return Err(CommandError::TooManyBuffers(count));
    }
    let lengths = (0..count as usize)
        .map(|i| u64_at(raw, LENGTHS_OFFSET + i * 8))
        .collect();
    Ok(Header {
        kind,
        client_id: u64_at(raw, CLIENT_ID_OFFSET) as i64,
        lengths,
        meta_len: u64_at(raw, META_LEN_OFFSET),
    })
}

/// Write header, buffers, then metadata. A partial write leaves the stream unusable.
pub fn write_command<W: Write>(w: &mut W, cmd: &Command) -> Result<(), CommandError> {
    let header = cmd.encode_header()?;
    w.write_all(&header)?;
    for b in &cmd.buffers {
        w.write_all(b)?;
    }
    if !cmd.metadata.is_empty() {
        w.write_all(&cmd.metadata)?;
    }
    w.flush()?;
    Ok(())
}

/// Read one command. Short reads are errors; partially read buffers are dropped.
pub fn read_command<R: Read>(r: &mut R) -> Result<Command, CommandError> {
    let mut raw = [0u8; HEADER_LEN];
    r.read_exact(&mut raw)?;
    let header = decode_header(&raw)?;

    let mut buffers = Vec::with_capacity(header.lengths.len());
    for len in &header.lengths {
        buffers.push(read_exact_len(r, *len)?);
    }
    let metadata = if header.meta_len > 0 {
        read_exact_len(r, header.meta_len)?
    } else {
        Bytes::new()
    };
    Ok(Command {
        kind: header.kind,
        client_id: header.client_id,
        buffers,
        metadata,
    })
}

/// Read exactly `len` bytes, growing the buffer as data arrives rather than trusting `len` up front.
fn read_exact_len<R: Read>(r: &mut R, len: u64) -> Result<Bytes, CommandError> {
    let expected = usize::try_from(len).map_err(|_| CommandError::OutOfMemory(len))?;
    let mut buf = Vec::new();
    r.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() != expected {
        return Err(CommandError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {expected} bytes, got {}", buf.len()),
        )));
    }
    Ok(Bytes::from(buf))
}

fn u32_at(raw: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&raw[at..at + 4]);
    u32::from_ne_bytes(b)
}

fn u64_at(raw: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&raw[at..at + 8]);
    u64::from_ne_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encoded(cmd: &Command) -> Vec<u8> {
        let mut out = Vec::new();
        write_command(&mut out, cmd).unwrap();
        out
    }

    #[test]
    fn header_is_c_layout() {
        assert_eq!(HEADER_LEN, 2080);
        let cmd = Command::capability(42, "caps-A");
        let h = cmd.encode_header().unwrap();
        assert_eq!(u32_at(&h, 0), COMMAND_TAG);
        assert_eq!(u32_at(&h, KIND_OFFSET), CommandKind::Capability as u32);
        assert_eq!(u64_at(&h, CLIENT_ID_OFFSET), 42);
        assert_eq!(u32_at(&h, COUNT_OFFSET), 1);
        assert_eq!(&h[20..24], &[0u8; 4]);
        assert_eq!(u64_at(&h, LENGTHS_OFFSET), 6);
        assert_eq!(u64_at(&h, META_LEN_OFFSET), 0);
    }

    #[test]
    fn transfer_over_stream() {
        let data = EdgeData::new();
        data.add(vec![5u8; 40]).unwrap();
        data.add(vec![6u8; 3]).unwrap();
        data.set_info("client_id", "99").unwrap();
        let cmd = Command::transfer(99, &data);

        let bytes = encoded(&cmd);
        let expected_meta = data.metadata().serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 43 + expected_meta.len());

        let back = read_command(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.buffers[0].len(), 40);
    }

    #[test]
    fn two_commands_back_to_back() {
        let mut bytes = encoded(&Command::capability(1, "a"));
        bytes.extend(encoded(&Command::host_info(1, "127.0.0.1", 3001, "b")));
        let mut cur = Cursor::new(bytes);
        let first = read_command(&mut cur).unwrap();
        let second = read_command(&mut cur).unwrap();
        assert_eq!(first.caps(), "a");
        assert_eq!(
            second.parse_host_info(),
            Some(("127.0.0.1".to_string(), 3001, "b".to_string()))
        );
    }

    #[test]
    fn rejects_bad_tag() {
        let mut bytes = encoded(&Command::error(3));
        bytes[..4].copy_from_slice(&0xdead_beef_u32.to_ne_bytes());
        assert!(matches!(
            read_command(&mut Cursor::new(bytes)),
            Err(CommandError::InvalidTag(0xdead_beef))
        ));
    }

    #[test]
    fn rejects_too_many_buffers_before_reading_body() {
        let mut bytes = encoded(&Command::error(3));
        bytes[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&300u32.to_ne_bytes());
        // Header only: any attempt to read a body would hit EOF instead.
        assert!(matches!(
            read_command(&mut Cursor::new(bytes)),
            Err(CommandError::TooManyBuffers(300))
        ));
    }

    #[test]
    fn short_body_is_io_error() {
        let data = EdgeData::new();
        data.add(vec![1u8; 64]).unwrap();
        let bytes = encoded(&Command::transfer(1, &data));
        let err = read_command(&mut Cursor::new(&bytes[..bytes.len() - 10])).unwrap_err();
        assert!(matches!(err, CommandError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn short_header_is_io_error() {
        let bytes = encoded(&Command::error(0));
        assert!(matches!(
            read_command(&mut Cursor::new(&bytes[..100])),
            Err(CommandError::Io(_))
        ));
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            split_host_port("[::1]:80"),
            Some(("::1".to_string(), 80))
        );
        assert_eq!(split_host_port("host:0"), None);
        assert_eq!(split_host_port("host"), None);
        assert_eq!(split_host_port(":80"), None);
    }
}
