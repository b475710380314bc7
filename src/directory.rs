//! Paged, sorted key/value directory: the one on-disk map shape used at every level of an
//! index file (measurements, tag keys, tag values, series block).
//!
//! Layout:
//! ```text
//! entries:   [var key_len | key | var value_len | value]*   (sorted, unique keys)
//! pages:     u32 offset of the first entry of each page (relative to the directory start)
//! footer:    entry_count u32 | page_count u32 | entries_len u32 | magic u32 "TDIR"
//! ```

use crate::encoding::{split_var_bytes, u32_at, write_u32, write_var_bytes};
use crate::error::IndexError;

pub(crate) const DIR_MAGIC: u32 = u32::from_le_bytes(*b"TDIR");
pub(crate) const DIR_FOOTER_LEN: usize = 16;

/// Builds a directory from keys pushed in strictly ascending order.
#[derive(Debug)]
pub(crate) struct DirectoryWriter {
    page_size: usize,
    entries: Vec<u8>,
    pages: Vec<u32>,
    count: u32,
    last_key: Option<Vec<u8>>,
}

impl DirectoryWriter {
    pub(crate) fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1) as usize,
            entries: Vec::new(),
            pages: Vec::new(),
            count: 0,
            last_key: None,
        }
    }

    pub(crate) fn push(&mut self, key: &[u8], value: &[u8]) -> Result<(), IndexError> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(IndexError::Encoding(format!(
                    "Directory keys out of order: {:?} after {:?}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(last)
                )));
            }
        }
        let page_start = self.pages.last().map(|&p| p as usize);
        let start_page = match page_start {
            None => true,
            Some(p) => self.entries.len() - p >= self.page_size,
        };
        if start_page {
            let off: u32 = self
                .entries
                .len()
                .try_into()
                .map_err(|_| IndexError::Encoding("Directory exceeds 4 GiB".to_string()))?;
            self.pages.push(off);
        }
        write_var_bytes(&mut self.entries, key);
        write_var_bytes(&mut self.entries, value);
        self.count = self
            .count
            .checked_add(1)
            .ok_or_else(|| IndexError::Encoding("Directory entry count overflow".to_string()))?;
        self.last_key = Some(key.to_vec());
        Ok(())
    }

    pub(crate) fn len(&self) -> u32 {
        self.count
    }

    /// Appends the finished directory to `out`.
    pub(crate) fn finish_into(self, out: &mut Vec<u8>) -> Result<(), IndexError> {
        let entries_len: u32 = self
            .entries
            .len()
            .try_into()
            .map_err(|_| IndexError::Encoding("Directory exceeds 4 GiB".to_string()))?;
        out.reserve(self.entries.len() + self.pages.len() * 4 + DIR_FOOTER_LEN);
        out.extend_from_slice(&self.entries);
        for p in &self.pages {
            write_u32(out, *p);
        }
        write_u32(out, self.count);
        write_u32(out, self.pages.len() as u32);
        write_u32(out, entries_len);
        write_u32(out, DIR_MAGIC);
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<Vec<u8>, IndexError> {
        let mut out = Vec::new();
        self.finish_into(&mut out)?;
        Ok(out)
    }
}

/// Read-only view over an encoded directory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Directory<'a> {
    entries: &'a [u8],
    pages: &'a [u8],
    count: u32,
}

impl<'a> Directory<'a> {
    /// Validates the footer. The page table and entries are decoded lazily.
    pub(crate) fn parse(bytes: &'a [u8]) -> Result<Self, String> {
        if bytes.len() < DIR_FOOTER_LEN {
            return Err(format!("Directory too short ({} bytes)", bytes.len()));
        }
        let f = bytes.len() - DIR_FOOTER_LEN;
        let count = u32_at(bytes, f).ok_or("Truncated directory footer")?;
        let page_count = u32_at(bytes, f + 4).ok_or("Truncated directory footer")? as usize;
        let entries_len = u32_at(bytes, f + 8).ok_or("Truncated directory footer")? as usize;
        let magic = u32_at(bytes, f + 12).ok_or("Truncated directory footer")?;
        if magic != DIR_MAGIC {
            return Err("Bad directory magic".to_string());
        }
        let pages_len = page_count
            .checked_mul(4)
            .ok_or("Directory page table overflow")?;
        if entries_len
            .checked_add(pages_len)
            .map(|n| n != f)
            .unwrap_or(true)
        {
            return Err("Directory section lengths do not add up".to_string());
        }
        if (count == 0) != (page_count == 0) || (count as usize) < page_count {
            return Err("Directory page count inconsistent with entry count".to_string());
        }
        Ok(Self {
            entries: &bytes[..entries_len],
            pages: &bytes[entries_len..f],
            count,
        })
    }

    /// Checks that page offsets start at zero, ascend and stay inside the entry section.
    pub(crate) fn check_pages(&self) -> Result<(), String> {
        let mut prev: Option<usize> = None;
        for i in 0..self.page_count() {
            let off = self.page_offset(i);
            let ok = match prev {
                None => off == 0,
                Some(p) => off > p,
            };
            if !ok || off >= self.entries.len() {
                return Err(format!("Invalid directory page offset {}", off));
            }
            prev = Some(off);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> u32 {
        self.count
    }

    fn page_count(&self) -> usize {
        self.pages.len() / 4
    }

    fn page_offset(&self, i: usize) -> usize {
        u32_at(self.pages, i * 4).unwrap_or(0) as usize
    }

    fn page_end(&self, i: usize) -> usize {
        if i + 1 < self.page_count() {
            self.page_offset(i + 1)
        } else {
            self.entries.len()
        }
    }

    /// Binary search over page first-keys, then a scan within one page.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<&'a [u8]>, String> {
        let n = self.page_count();
        if n == 0 {
            return Ok(None);
        }
        // Find the last page whose first key <= key.
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (first, _) = entry_at(self.entries, self.page_offset(mid))?;
            if first <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        let page = lo - 1;
        let mut cur = EntryCursor {
            pos: self.page_offset(page),
            end: self.page_end(page),
        };
        while let Some(entry) = cur.next_entry(self.entries) {
            let (k, v) = entry?;
            match k.cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(v)),
                std::cmp::Ordering::Greater => return Ok(None),
                std::cmp::Ordering::Less => {}
            }
        }
        Ok(None)
    }

    /// Cursor over all entries, relative to [`Directory::entries`].
    pub(crate) fn cursor(&self) -> EntryCursor {
        EntryCursor {
            pos: 0,
            end: self.entries.len(),
        }
    }

    pub(crate) fn entries(&self) -> &'a [u8] {
        self.entries
    }

    pub(crate) fn iter(&self) -> DirectoryIter<'a> {
        DirectoryIter {
            entries: self.entries,
            cursor: self.cursor(),
        }
    }

    /// Decodes every entry and checks page table, ordering and count.
    pub(crate) fn check_entries(&self) -> Result<(), String> {
        self.check_pages()?;
        let mut prev: Option<&[u8]> = None;
        let mut seen = 0u32;
        for entry in self.iter() {
            let (k, _) = entry?;
            if let Some(p) = prev {
                if k <= p {
                    return Err("Directory keys are not strictly ascending".to_string());
                }
            }
            prev = Some(k);
            seen += 1;
        }
        if seen != self.count {
            return Err(format!(
                "Directory holds {} entries, footer says {}",
                seen, self.count
            ));
        }
        Ok(())
    }
}

/// Position within a directory's entry section. Plain offsets, so owners of the backing
/// bytes can hold one without borrowing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EntryCursor {
    pos: usize,
    end: usize,
}

impl EntryCursor {
    pub(crate) fn exhausted() -> Self {
        Self::default()
    }

    pub(crate) fn next_entry<'b>(
        &mut self,
        entries: &'b [u8],
    ) -> Option<Result<(&'b [u8], &'b [u8]), String>> {
        if self.pos >= self.end {
            return None;
        }
        let window = match entries.get(self.pos..self.end) {
            Some(w) => w,
            None => {
                self.pos = self.end;
                return Some(Err("Directory cursor out of range".to_string()));
            }
        };
        match split_entry(window) {
            Ok((k, v, used)) => {
                self.pos += used;
                Some(Ok((k, v)))
            }
            Err(e) => {
                self.pos = self.end;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DirectoryIter<'a> {
    entries: &'a [u8],
    cursor: EntryCursor,
}

impl<'a> Iterator for DirectoryIter<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next_entry(self.entries)
    }
}

fn entry_at(entries: &[u8], off: usize) -> Result<(&[u8], &[u8]), String> {
    let window = entries.get(off..).ok_or("Directory offset out of range")?;
    split_entry(window).map(|(k, v, _)| (k, v))
}

fn split_entry(bytes: &[u8]) -> Result<(&[u8], &[u8], usize), String> {
    let (key, rest) = split_var_bytes(bytes)?;
    let (value, rest2) = split_var_bytes(rest)?;
    Ok((key, value, bytes.len() - rest2.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(n: u32, page_size: u32) -> Vec<u8> {
        let mut w = DirectoryWriter::new(page_size);
        for i in 0..n {
            let k = format!("key{:05}", i);
            let v = format!("value{}", i);
            w.push(k.as_bytes(), v.as_bytes()).unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn lookups_hit_every_key_across_pages() {
        let bytes = build(500, 64);
        let dir = Directory::parse(&bytes).unwrap();
        assert_eq!(dir.len(), 500);
        assert!(dir.page_count() > 10);
        for i in 0..500 {
            let k = format!("key{:05}", i);
            let v = dir.get(k.as_bytes()).unwrap().unwrap();
            assert_eq!(v, format!("value{}", i).as_bytes());
        }
        assert_eq!(dir.get(b"key").unwrap(), None);
        assert_eq!(dir.get(b"key00010x").unwrap(), None);
        assert_eq!(dir.get(b"zzz").unwrap(), None);
        dir.check_entries().unwrap();
    }

    #[test]
    fn page_size_changes_layout_not_content() {
        let small = build(100, 64);
        let large = build(100, 4096);
        assert_ne!(small, large);
        let a: Vec<_> = Directory::parse(&small).unwrap().iter().map(|e| e.unwrap()).collect();
        let b: Vec<_> = Directory::parse(&large).unwrap().iter().map(|e| e.unwrap()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_directory() {
        let bytes = DirectoryWriter::new(4096).finish().unwrap();
        assert_eq!(bytes.len(), DIR_FOOTER_LEN);
        let dir = Directory::parse(&bytes).unwrap();
        assert_eq!(dir.len(), 0);
        assert_eq!(dir.get(b"x").unwrap(), None);
        assert_eq!(dir.iter().count(), 0);
    }

    #[test]
    fn writer_rejects_unsorted_keys() {
        let mut w = DirectoryWriter::new(64);
        w.push(b"b", b"").unwrap();
        assert!(matches!(w.push(b"a", b""), Err(IndexError::Encoding(_))));
        assert!(matches!(w.push(b"b", b""), Err(IndexError::Encoding(_))));
    }

    #[test]
    fn parse_rejects_damaged_footers() {
        let bytes = build(20, 64);
        assert!(Directory::parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(Directory::parse(&bytes[1..]).is_err());
        let mut bad = bytes.clone();
        let n = bad.len();
        bad[n - 1] ^= 0xFF;
        assert!(Directory::parse(&bad).is_err());
        assert!(Directory::parse(b"short").is_err());
    }

    #[test]
    fn damaged_page_table_is_caught_by_checks() {
        let mut bytes = build(200, 64);
        let dir = Directory::parse(&bytes).unwrap();
        let pages_at = dir.entries().len();
        // Point the second page past the entry section.
        bytes[pages_at + 4..pages_at + 8].copy_from_slice(&u32::MAX.to_le_bytes());
        let dir = Directory::parse(&bytes).unwrap();
        assert!(dir.check_pages().is_err());
        assert!(dir.check_entries().is_err());
    }
}
