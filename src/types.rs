use crate::encoding::{read_var_bytes, read_var_u32, write_var_bytes, write_var_u32};
use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Series identifier issued by the series file. Zero is never assigned.
pub type SeriesId = u64;

/// TagSet type used at the API edge (string tags, as most callers hold them).
pub type TagSet = HashMap<String, String>;

/// A single key/value label of a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Tag set in canonical form: sorted by key, keys unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tags(Vec<Tag>);

impl Tags {
    /// Builds a canonical tag set. Duplicate keys are rejected.
    pub fn new<I, K, V>(pairs: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        let mut tags: Vec<Tag> = pairs
            .into_iter()
            .map(|(k, v)| Tag {
                key: k.into(),
                value: v.into(),
            })
            .collect();
        tags.sort_by(|a, b| a.key.cmp(&b.key));
        for w in tags.windows(2) {
            if w[0].key == w[1].key {
                return Err(IndexError::InvalidSeries(format!(
                    "duplicate tag key {:?}",
                    String::from_utf8_lossy(&w[0].key)
                )));
            }
        }
        Ok(Tags(tags))
    }

    /// Convenience constructor for string pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Result<Self, IndexError> {
        Self::new(pairs.iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())))
    }

    pub fn from_tag_set(tags: &TagSet) -> Self {
        // HashMap keys are unique, so canonicalization cannot fail.
        let mut v: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag {
                key: k.as_bytes().to_vec(),
                value: v.as_bytes().to_vec(),
            })
            .collect();
        v.sort_by(|a, b| a.key.cmp(&b.key));
        Tags(v)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the value for `key`, binary searching the sorted set.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.0
            .binary_search_by(|t| t.key.as_slice().cmp(key))
            .ok()
            .map(|i| self.0[i].value.as_slice())
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Canonical series key: (measurement, sorted tag set) for stable hashing and equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    measurement: Vec<u8>,
    tags: Tags,
}

impl SeriesKey {
    pub fn new(measurement: impl Into<Vec<u8>>, tags: Tags) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
        }
    }

    pub fn measurement(&self) -> &[u8] {
        &self.measurement
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    /// Rejects identities the index cannot represent: empty measurement, empty tag key or value.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.measurement.is_empty() {
            return Err(IndexError::InvalidSeries(
                "measurement name must not be empty".to_string(),
            ));
        }
        for t in &self.tags {
            if t.key.is_empty() {
                return Err(IndexError::InvalidSeries(format!(
                    "empty tag key in series {}",
                    self
                )));
            }
            if t.value.is_empty() {
                return Err(IndexError::InvalidSeries(format!(
                    "empty value for tag {:?} in series {}",
                    String::from_utf8_lossy(&t.key),
                    self
                )));
            }
        }
        Ok(())
    }

    /// Appends the canonical binary form: measurement, tag count, then (key, value) pairs.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        write_var_bytes(buf, &self.measurement);
        write_var_u32(buf, self.tags.len() as u32);
        for t in &self.tags {
            write_var_bytes(buf, &t.key);
            write_var_bytes(buf, &t.value);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut cur = std::io::Cursor::new(bytes);
        let measurement = read_var_bytes(&mut cur)?;
        let n = read_var_u32(&mut cur)? as usize;
        if n > bytes.len() {
            return Err("Tag count exceeds key length".to_string());
        }
        let mut tags = Vec::with_capacity(n);
        for _ in 0..n {
            let key = read_var_bytes(&mut cur)?;
            let value = read_var_bytes(&mut cur)?;
            tags.push(Tag { key, value });
        }
        if cur.position() as usize != bytes.len() {
            return Err("Trailing bytes after series key".to_string());
        }
        if tags.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err("Series key tags are not in canonical order".to_string());
        }
        Ok(Self {
            measurement,
            tags: Tags(tags),
        })
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.measurement))?;
        for t in &self.tags {
            write!(
                f,
                ",{}={}",
                String::from_utf8_lossy(&t.key),
                String::from_utf8_lossy(&t.value)
            )?;
        }
        Ok(())
    }
}
