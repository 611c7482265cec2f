//! Canonical content hashing.
//!
//! Every byte fed to the hasher is framed: a one-byte tag says what follows
//! and variable-length items are length-prefixed, so two different values
//! can never produce the same stream. Map entries are written in key order,
//! which `BTreeMap` gives us for free.

use serde::Serialize;

use crate::core::Hash32;
use crate::error::Error;
use crate::value::Value;

pub(crate) const TAG_NULL: u8 = 0;
pub(crate) const TAG_BOOL: u8 = 1;
pub(crate) const TAG_INTEGER: u8 = 2;
pub(crate) const TAG_FLOAT: u8 = 3;
pub(crate) const TAG_TEXT: u8 = 4;
pub(crate) const TAG_BYTES: u8 = 5;
pub(crate) const TAG_LIST: u8 = 6;
pub(crate) const TAG_MAP: u8 = 7;
pub(crate) const TAG_NODE: u8 = 8;

/// Incremental BLAKE3 hasher speaking the framing described above.
pub(crate) struct HashWriter(blake3::Hasher);

impl HashWriter {
    /// Starts a hash in the given domain. Hashes of different domains never
    /// collide even when the framed payload is identical.
    pub(crate) fn new(domain: &str) -> Self {
        let mut writer = HashWriter(blake3::Hasher::new());
        writer.write_str(concat!(env!("CARGO_PKG_NAME"), "/1"));
        writer.write_str(domain);
        writer
    }

    pub(crate) fn write_tag(&mut self, tag: u8) {
        self.0.update(&[tag]);
    }

    pub(crate) fn write_u64(&mut self, value: u64) {
        self.0.update(&value.to_le_bytes());
    }

    pub(crate) fn write_len(&mut self, len: usize) {
        self.write_u64(len as u64);
    }

    pub(crate) fn write_str(&mut self, value: &str) {
        self.write_len(value.len());
        self.0.update(value.as_bytes());
    }

    pub(crate) fn write_hash(&mut self, hash: &Hash32) {
        self.0.update(hash.as_bytes());
    }

    pub(crate) fn write_value(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Null => self.write_tag(TAG_NULL),
            Value::Bool(b) => {
                self.write_tag(TAG_BOOL);
                self.0.update(&[*b as u8]);
            }
            Value::Integer(i) => {
                self.write_tag(TAG_INTEGER);
                self.0.update(&i.to_le_bytes());
            }
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(Error::unhashable(format!("non-finite float {f}")));
                }
                // -0.0 == 0.0, so they must hash alike
                let f = if *f == 0.0 { 0.0 } else { *f };
                self.write_tag(TAG_FLOAT);
                self.write_u64(f.to_bits());
            }
            Value::Text(s) => {
                self.write_tag(TAG_TEXT);
                self.write_str(s);
            }
            Value::Bytes(b) => {
                self.write_tag(TAG_BYTES);
                self.write_len(b.len());
                self.0.update(b);
            }
            Value::List(items) => {
                self.write_tag(TAG_LIST);
                self.write_len(items.len());
                for item in items {
                    self.write_value(item)?;
                }
            }
            Value::Map(map) => {
                self.write_tag(TAG_MAP);
                self.write_len(map.len());
                for (key, item) in map {
                    self.write_str(key);
                    self.write_value(item)?;
                }
            }
        }
        Ok(())
    }
}

impl From<HashWriter> for Hash32 {
    fn from(value: HashWriter) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// Types with a canonical, process-independent content hash.
pub trait ContentHash {
    fn content_hash(&self) -> Result<Hash32, Error>;
}

impl ContentHash for Value {
    fn content_hash(&self) -> Result<Hash32, Error> {
        let mut writer = HashWriter::new("value");
        writer.write_value(self)?;
        Ok(writer.into())
    }
}

/// Hashes any serializable value through the [`Value`] model.
///
/// Equal values hash equally regardless of the process, platform or order in
/// which map entries were inserted.
pub fn hash<T>(value: &T) -> Result<Hash32, Error>
where
    T: Serialize + ?Sized,
{
    Value::from_serialize(value)?.content_hash()
}
