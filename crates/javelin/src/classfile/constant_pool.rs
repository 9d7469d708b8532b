//! The class-file constant pool.
//!
//! Entries are interned on first use and written out once. Indices are
//! 1-based per the class-file format, and `long`/`double` entries occupy
//! two slots.

use ahash::AHashMap;

use crate::error::CompileError;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_LONG: u8 = 5;
const TAG_DOUBLE: u8 = 6;
const TAG_CLASS: u8 = 7;
const TAG_STRING: u8 = 8;
const TAG_FIELDREF: u8 = 9;
const TAG_METHODREF: u8 = 10;
const TAG_NAME_AND_TYPE: u8 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Entry {
    Utf8(String),
    Integer(i32),
    /// IEEE bits, so NaN payloads intern consistently.
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    NameAndType(u16, u16),
}

impl Entry {
    /// `long` and `double` take two pool slots.
    fn width(&self) -> u16 {
        match self {
            Entry::Long(_) | Entry::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Deduplicating constant pool builder.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<Entry>,
    indices: AHashMap<Entry, u16>,
    /// Next free slot; starts at 1 because slot 0 is reserved.
    next: u16,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            indices: AHashMap::new(),
            next: 1,
        }
    }

    fn intern(&mut self, entry: Entry) -> Result<u16, CompileError> {
        if let Some(&idx) = self.indices.get(&entry) {
            return Ok(idx);
        }
        let idx = self.next;
        let width = entry.width();
        if u32::from(idx) + u32::from(width) > 0xFFFF {
            return Err(CompileError::capacity("constant pool exceeds 65535 entries"));
        }
        self.next = idx + width;
        self.indices.insert(entry.clone(), idx);
        self.entries.push(entry);
        Ok(idx)
    }

    pub fn utf8(&mut self, text: &str) -> Result<u16, CompileError> {
        if modified_utf8_len(text) > usize::from(u16::MAX) {
            return Err(CompileError::capacity(
                "string constant exceeds 65535 bytes in its class-file encoding",
            ));
        }
        self.intern(Entry::Utf8(text.to_string()))
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, CompileError> {
        self.intern(Entry::Integer(value))
    }

    pub fn long(&mut self, value: i64) -> Result<u16, CompileError> {
        self.intern(Entry::Long(value))
    }

    pub fn double(&mut self, value: f64) -> Result<u16, CompileError> {
        self.intern(Entry::Double(value.to_bits()))
    }

    /// Internal-form class name, e.g. `javelin/runtime/Value`.
    pub fn class(&mut self, name: &str) -> Result<u16, CompileError> {
        let name_idx = self.utf8(name)?;
        self.intern(Entry::Class(name_idx))
    }

    pub fn string(&mut self, text: &str) -> Result<u16, CompileError> {
        let utf8_idx = self.utf8(text)?;
        self.intern(Entry::String(utf8_idx))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, CompileError> {
        let name_idx = self.utf8(name)?;
        let desc_idx = self.utf8(descriptor)?;
        self.intern(Entry::NameAndType(name_idx, desc_idx))
    }

    pub fn fieldref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, CompileError> {
        let class_idx = self.class(class)?;
        let nat_idx = self.name_and_type(name, descriptor)?;
        self.intern(Entry::Fieldref(class_idx, nat_idx))
    }

    pub fn methodref(&mut self, class: &str, name: &str, descriptor: &str) -> Result<u16, CompileError> {
        let class_idx = self.class(class)?;
        let nat_idx = self.name_and_type(name, descriptor)?;
        self.intern(Entry::Methodref(class_idx, nat_idx))
    }

    /// Number of slots plus one, as the `constant_pool_count` field expects.
    pub fn count(&self) -> u16 {
        self.next
    }

    /// Serializes `constant_pool_count` followed by every entry.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.count().to_be_bytes());
        for entry in &self.entries {
            match entry {
                Entry::Utf8(text) => {
                    out.push(TAG_UTF8);
                    let encoded = encode_modified_utf8(text);
                    out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                    out.extend_from_slice(&encoded);
                }
                Entry::Integer(value) => {
                    out.push(TAG_INTEGER);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Entry::Long(value) => {
                    out.push(TAG_LONG);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Entry::Double(bits) => {
                    out.push(TAG_DOUBLE);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Entry::Class(name_idx) => {
                    out.push(TAG_CLASS);
                    out.extend_from_slice(&name_idx.to_be_bytes());
                }
                Entry::String(utf8_idx) => {
                    out.push(TAG_STRING);
                    out.extend_from_slice(&utf8_idx.to_be_bytes());
                }
                Entry::Fieldref(class_idx, nat_idx) => {
                    out.push(TAG_FIELDREF);
                    out.extend_from_slice(&class_idx.to_be_bytes());
                    out.extend_from_slice(&nat_idx.to_be_bytes());
                }
                Entry::Methodref(class_idx, nat_idx) => {
                    out.push(TAG_METHODREF);
                    out.extend_from_slice(&class_idx.to_be_bytes());
                    out.extend_from_slice(&nat_idx.to_be_bytes());
                }
                Entry::NameAndType(name_idx, desc_idx) => {
                    out.push(TAG_NAME_AND_TYPE);
                    out.extend_from_slice(&name_idx.to_be_bytes());
                    out.extend_from_slice(&desc_idx.to_be_bytes());
                }
            }
        }
    }
}

/// JVM modified UTF-8: NUL becomes the two-byte form and supplementary
/// characters are written as surrogate pairs, each CESU-8 encoded.
/// Encoded size of `text` without building the bytes; mirrors
/// [`encode_modified_utf8`] so the length check can run at intern time.
fn modified_utf8_len(text: &str) -> usize {
    text.chars()
        .map(|ch| match ch as u32 {
            0 => 2,
            1..=0x7F => 1,
            0x80..=0x7FF => 2,
            0x800..=0xFFFF => 3,
            _ => 6,
        })
        .sum()
}

fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for ch in text.chars() {
        let code = ch as u32;
        match code {
            0 => out.extend_from_slice(&[0xC0, 0x80]),
            1..=0x7F => out.push(code as u8),
            0x80..=0x7FF => {
                out.push(0xC0 | (code >> 6) as u8);
                out.push(0x80 | (code & 0x3F) as u8);
            }
            0x800..=0xFFFF => {
                out.push(0xE0 | (code >> 12) as u8);
                out.push(0x80 | ((code >> 6) & 0x3F) as u8);
                out.push(0x80 | (code & 0x3F) as u8);
            }
            _ => {
                let shifted = code - 0x10000;
                let high = 0xD800 + (shifted >> 10);
                let low = 0xDC00 + (shifted & 0x3FF);
                for unit in [high, low] {
                    out.push(0xE0 | (unit >> 12) as u8);
                    out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    out.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn interning_deduplicates() {
        let mut pool = ConstantPool::new();
        let a = pool.utf8("Code").unwrap();
        let b = pool.utf8("Code").unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.count(), 2);
    }

    #[test]
    fn longs_and_doubles_take_two_slots() {
        let mut pool = ConstantPool::new();
        let long_idx = pool.long(42).unwrap();
        let next = pool.utf8("after").unwrap();
        assert_eq!(long_idx, 1);
        assert_eq!(next, 3);

        let d1 = pool.double(1.5).unwrap();
        let d2 = pool.double(1.5).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(pool.count(), 6);
    }

    #[test]
    fn methodref_builds_its_dependency_chain() {
        let mut pool = ConstantPool::new();
        let idx = pool
            .methodref("javelin/runtime/Py", "iter", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;")
            .unwrap();
        // utf8 name, class, utf8 method name, utf8 descriptor, name-and-type,
        // then the methodref itself.
        assert_eq!(idx, 6);
        let again = pool
            .methodref("javelin/runtime/Py", "iter", "(Ljavelin/runtime/Value;)Ljavelin/runtime/Value;")
            .unwrap();
        assert_eq!(again, idx);
    }

    #[test]
    fn serialization_layout() {
        let mut pool = ConstantPool::new();
        pool.integer(7).unwrap();
        let mut out = Vec::new();
        pool.write(&mut out);
        assert_eq!(out, vec![0, 2, TAG_INTEGER, 0, 0, 0, 7]);
    }

    #[test]
    fn oversized_utf8_is_a_capacity_error() {
        let mut pool = ConstantPool::new();
        assert!(pool.utf8(&"x".repeat(65_535)).is_ok());
        assert!(pool.utf8(&"x".repeat(65_536)).is_err());
        // Two-byte chars blow the encoded length at half the char count.
        assert!(pool.utf8(&"é".repeat(40_000)).is_err());
    }

    #[test]
    fn modified_utf8_handles_nul_and_supplementary() {
        assert_eq!(encode_modified_utf8("a\u{0}b"), vec![b'a', 0xC0, 0x80, b'b']);
        // U+1F600 encodes as a CESU-8 surrogate pair, six bytes.
        assert_eq!(encode_modified_utf8("\u{1F600}").len(), 6);
        assert_eq!(encode_modified_utf8("é"), vec![0xC3, 0xA9]);
    }
}
