//! Edge data: up to [`MAX_BUFFERS`] raw buffers plus a metadata store.
//!
//! An `EdgeData` may be filled on a network thread while a user thread reads
//! it, so all access goes through a per-object lock.
//!
//! Full serialized form (native byte order, C layout):
//!
//! ```text
//! [count: u32][pad: 4][len: u64; 256][meta_len: u64][buffer bytes...][metadata blob]
//! ```

use std::fmt;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{EdgeError, Result};
use crate::metadata::Metadata;
use crate::protocol::MAX_BUFFERS;

/// Size of the full-data header.
pub const DATA_HEADER_LEN: usize = 8 + MAX_BUFFERS * 8 + 8;
const LENGTHS_OFFSET: usize = 8;
const META_LEN_OFFSET: usize = LENGTHS_OFFSET + MAX_BUFFERS * 8;

/// Called once when the buffer it was attached to is dropped.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// One raw buffer. Cloning the view (`bytes()`) never copies.
pub struct Buffer {
    bytes: Bytes,
    release: Option<ReleaseFn>,
}

impl Buffer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            release: None,
        }
    }

    pub fn with_release(bytes: impl Into<Bytes>, release: ReleaseFn) -> Self {
        Self {
            bytes: bytes.into(),
            release: Some(release),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.bytes.len())
            .field("release", &self.release.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct DataInner {
    buffers: Vec<Buffer>,
    metadata: Metadata,
}

/// Payload exchanged between edge nodes.
#[derive(Debug, Default)]
pub struct EdgeData {
    inner: Mutex<DataInner>,
}

impl EdgeData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble from decoded wire parts without copying the buffers.
    pub(crate) fn from_parts(buffers: Vec<Bytes>, metadata: Metadata) -> Result<Self> {
        if buffers.len() > MAX_BUFFERS {
            return Err(EdgeError::invalid(format!(
                "{} buffers exceeds limit {MAX_BUFFERS}",
                buffers.len()
            )));
        }
        let buffers = buffers.into_iter().map(Buffer::new).collect();
        Ok(Self {
            inner: Mutex::new(DataInner { buffers, metadata }),
        })
    }

    /// Append a buffer. Empty buffers and the buffer past the limit are rejected.
    pub fn add(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.add_buffer(Buffer::new(bytes))
    }

    /// Append a buffer whose `release` runs when this data (or the buffer) is dropped.
    /// On rejection `release` runs immediately.
    pub fn add_with_release(&self, bytes: impl Into<Bytes>, release: ReleaseFn) -> Result<()> {
        self.add_buffer(Buffer::with_release(bytes, release))
    }

    fn add_buffer(&self, buffer: Buffer) -> Result<()> {
        if buffer.is_empty() {
            return Err(EdgeError::invalid("empty buffer"));
        }
        let mut inner = self.inner.lock();
        if inner.buffers.len() >= MAX_BUFFERS {
            return Err(EdgeError::invalid(format!(
                "data already holds {MAX_BUFFERS} buffers"
            )));
        }
        inner.buffers.push(buffer);
        Ok(())
    }

    /// Shared view of buffer `index`; the data keeps ownership.
    pub fn get(&self, index: usize) -> Result<Bytes> {
        let inner = self.inner.lock();
        inner
            .buffers
            .get(index)
            .map(|b| b.bytes().clone())
            .ok_or_else(|| {
                EdgeError::invalid(format!(
                    "buffer index {index} out of range ({})",
                    inner.buffers.len()
                ))
            })
    }

    pub fn count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    /// Shared views of every buffer, in order.
    pub fn buffers(&self) -> Vec<Bytes> {
        self.inner
            .lock()
            .buffers
            .iter()
            .map(|b| b.bytes().clone())
            .collect()
    }

    pub fn get_info(&self, key: &str) -> Option<String> {
        self.inner.lock().metadata.get(key)
    }

    pub fn set_info(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().metadata.set(key, value)
    }

    pub fn remove_info(&self, key: &str) -> Option<String> {
        self.inner.lock().metadata.remove(key)
    }

    pub fn clear_info(&self) {
        self.inner.lock().metadata.clear();
    }

    /// Copy of the metadata store.
    pub fn metadata(&self) -> Metadata {
        self.inner.lock().metadata.clone()
    }

    /// Deep copy: every buffer and the metadata are duplicated.
    pub fn copy(&self) -> Result<EdgeData> {
        let inner = self.inner.lock();
        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(inner.buffers.len())
            .map_err(|_| EdgeError::OutOfMemory)?;
        for b in &inner.buffers {
            let mut dup = Vec::new();
            dup.try_reserve_exact(b.len())
                .map_err(|_| EdgeError::OutOfMemory)?;
            dup.extend_from_slice(b.bytes());
            buffers.push(Buffer::new(dup));
        }
        let mut metadata = Metadata::new();
        metadata.copy_from(&inner.metadata)?;
        Ok(EdgeData {
            inner: Mutex::new(DataInner { buffers, metadata }),
        })
    }

    /// Full-data serialization: header, buffer bytes, metadata blob.
    pub fn serialize(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let meta = inner.metadata.serialize();
        let body: usize = inner.buffers.iter().map(Buffer::len).sum();
        let mut out = Vec::with_capacity(DATA_HEADER_LEN + body + meta.len());
        out.extend_from_slice(&(inner.buffers.len() as u32).to_ne_bytes());
        out.extend_from_slice(&[0u8; 4]);
        for i in 0..MAX_BUFFERS {
            let len = inner.buffers.get(i).map_or(0, |b| b.len() as u64);
            out.extend_from_slice(&len.to_ne_bytes());
        }
        out.extend_from_slice(&(meta.len() as u64).to_ne_bytes());
        for b in &inner.buffers {
            out.extend_from_slice(b.bytes());
        }
        out.extend_from_slice(&meta);
        out
    }

    /// Rebuild data from its full-data serialization.
    pub fn deserialize(bytes: &[u8]) -> Result<EdgeData> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(EdgeError::Malformed(format!(
                "serialized data is {} bytes, header needs {DATA_HEADER_LEN}",
                bytes.len()
            )));
        }
        let count = read_u32(bytes, 0) as usize;
        if count > MAX_BUFFERS {
            return Err(EdgeError::Malformed(format!(
                "buffer count {count} exceeds {MAX_BUFFERS}"
            )));
        }
        let meta_len = read_u64(bytes, META_LEN_OFFSET);

        let mut offset = DATA_HEADER_LEN;
        let mut buffers = Vec::with_capacity(count);
        for i in 0..count {
            let len = read_u64(bytes, LENGTHS_OFFSET + i * 8);
            let end = checked_end(offset, len, bytes.len())?;
            buffers.push(Bytes::copy_from_slice(&bytes[offset..end]));
            offset = end;
        }
        let end = checked_end(offset, meta_len, bytes.len())?;
        let mut metadata = Metadata::new();
        if end > offset {
            metadata.deserialize(&bytes[offset..end])?;
        }
        EdgeData::from_parts(buffers, metadata)
    }
}

fn checked_end(offset: usize, len: u64, total: usize) -> Result<usize> {
    usize::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .filter(|end| *end <= total)
        .ok_or_else(|| EdgeError::Malformed("serialized data truncated".into()))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut v);
        v
    }

    #[test]
    fn add_and_get() {
        let data = EdgeData::new();
        data.add(vec![1u8, 2, 3]).unwrap();
        data.add(&b"tensor"[..]).unwrap();
        assert_eq!(data.count(), 2);
        assert_eq!(&data.get(1).unwrap()[..], b"tensor");
        assert!(matches!(data.get(2), Err(EdgeError::InvalidParameter(_))));
    }

    #[test]
    fn rejects_empty_buffer() {
        let data = EdgeData::new();
        assert!(matches!(
            data.add(Vec::new()),
            Err(EdgeError::InvalidParameter(_))
        ));
        assert_eq!(data.count(), 0);
    }

    #[test]
    fn buffer_limit_enforced() {
        let data = EdgeData::new();
        for i in 0..MAX_BUFFERS {
            data.add(vec![i as u8; 1]).unwrap();
        }
        assert!(matches!(
            data.add(vec![0u8; 1]),
            Err(EdgeError::InvalidParameter(_))
        ));
        assert_eq!(data.count(), MAX_BUFFERS);
    }

    #[test]
    fn release_runs_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let data = EdgeData::new();
        for _ in 0..3 {
            let r = released.clone();
            data.add_with_release(
                vec![7u8; 8],
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(data);
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn copy_is_deep_and_independent() {
        let data = EdgeData::new();
        data.add(random_bytes(40)).unwrap();
        data.add(random_bytes(7)).unwrap();
        data.set_info("client_id", "42").unwrap();

        let dup = data.copy().unwrap();
        assert_eq!(dup.count(), data.count());
        for i in 0..data.count() {
            assert_eq!(dup.get(i).unwrap(), data.get(i).unwrap());
        }
        assert_eq!(dup.metadata(), data.metadata());

        dup.set_info("client_id", "7").unwrap();
        drop(dup);
        assert_eq!(data.get_info("client_id").as_deref(), Some("42"));
        assert_eq!(data.get(0).unwrap().len(), 40);
    }

    #[test]
    fn serialize_roundtrip() {
        let data = EdgeData::new();
        for len in [1usize, 40, 1024] {
            data.add(random_bytes(len)).unwrap();
        }
        data.set_info("format", "static").unwrap();

        let bytes = data.serialize();
        assert_eq!(&bytes[..4], &3u32.to_ne_bytes());
        let back = EdgeData::deserialize(&bytes).unwrap();
        assert_eq!(back.buffers(), data.buffers());
        assert_eq!(back.metadata(), data.metadata());
    }

    #[test]
    fn serialize_full_capacity() {
        let data = EdgeData::new();
        for i in 0..MAX_BUFFERS {
            data.add(vec![i as u8; 1 + i % 5]).unwrap();
        }
        let back = EdgeData::deserialize(&data.serialize()).unwrap();
        assert_eq!(back.count(), MAX_BUFFERS);
        assert_eq!(back.buffers(), data.buffers());
    }

    #[test]
    fn deserialize_rejects_bad_input() {
        assert!(EdgeData::deserialize(&[0u8; 16]).is_err());

        let data = EdgeData::new();
        data.add(vec![1u8; 32]).unwrap();
        let bytes = data.serialize();
        assert!(EdgeData::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut too_many = bytes.clone();
        too_many[..4].copy_from_slice(&((MAX_BUFFERS as u32) + 1).to_ne_bytes());
        assert!(matches!(
            EdgeData::deserialize(&too_many),
            Err(EdgeError::Malformed(_))
        ));
    }
}
