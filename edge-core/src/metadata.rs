//! Metadata store: case-insensitive string key/value pairs, last write wins.
//!
//! Serialized form (native byte order):
//!
//! ```text
//! [count: u32][key\0][value\0][key\0][value\0]...
//! ```

use std::collections::VecDeque;

use crate::error::{EdgeError, Result};

const COUNT_SIZE: usize = 4;

/// Ordered key/value store. Newest keys come first; keys are unique ignoring ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: VecDeque<(String, String)>,
}

fn check_text(what: &str, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(EdgeError::invalid(format!("{what} contains NUL")));
    }
    Ok(())
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set `key` to `value`. An existing key (any case) keeps its position and spelling.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(EdgeError::invalid("empty metadata key"));
        }
        check_text("key", key)?;
        check_text("value", value)?;
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some((_, v)) => *v = value.to_string(),
            None => self.entries.push_front((key.to_string(), value.to_string())),
        }
        Ok(())
    }

    /// Copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        self.entries.remove(idx).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace this store with a copy of `src`. Self is untouched unless every entry copied.
    pub fn copy_from(&mut self, src: &Metadata) -> Result<()> {
        let mut staged = VecDeque::new();
        staged
            .try_reserve_exact(src.entries.len())
            .map_err(|_| EdgeError::OutOfMemory)?;
        staged.extend(src.entries.iter().cloned());
        self.entries = staged;
        Ok(())
    }

    /// Number of bytes `serialize` will produce.
    pub fn serialized_len(&self) -> usize {
        COUNT_SIZE
            + self
                .entries
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2)
                .sum::<usize>()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        out.extend_from_slice(&(self.entries.len() as u32).to_ne_bytes());
        for (k, v) in &self.entries {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out
    }

    /// Replace the contents with the entries in `bytes`. On error the store is unchanged.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < COUNT_SIZE {
            return Err(EdgeError::Malformed("metadata shorter than count".into()));
        }
        let count = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let mut rest = &bytes[COUNT_SIZE..];
        let mut staged = Metadata::new();
        for _ in 0..count {
            let key = next_field(&mut rest)?;
            let value = next_field(&mut rest)?;
            if key.is_empty() {
                return Err(EdgeError::Malformed("empty metadata key".into()));
            }
            // Serialized order is newest first; appending keeps it.
            if !staged
                .entries
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case(&key))
            {
                staged.entries.push_back((key, value));
            }
        }
        self.entries = staged.entries;
        Ok(())
    }
}

/// Take one NUL-terminated string off the front of `rest`.
fn next_field(rest: &mut &[u8]) -> Result<String> {
    let end = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| EdgeError::Malformed("metadata truncated".into()))?;
    let field = String::from_utf8(rest[..end].to_vec())
        .map_err(|_| EdgeError::Malformed("metadata is not UTF-8".into()))?;
    *rest = &rest[end + 1..];
    Ok(field)
}
