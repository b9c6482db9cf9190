//! Module implement the string primitive used across the database.
//!
//! A [SelvaString] owns an immutable or mutable byte buffer, with optional
//! CRC-32 protection, optional deflate compression and a process wide
//! intern pool for strings that are shared by value.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    io::{Read, Write},
    rc::Rc,
};

use crate::Result;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// String behaviour flags.
///
/// `COMPRESS` is deliberately not part of this set; whether a string is
/// compressed is carried by separate compression metadata and surfaces as
/// a distinct tag only in the serialization format.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StringFlags(pub u8);

impl StringFlags {
    /// CRC enabled.
    pub const CRC: StringFlags = StringFlags(0x01);
    /// Permanently shared string, a no-op on free.
    pub const FREEZE: StringFlags = StringFlags(0x02);
    /// Mutable heap buffer.
    pub const MUTABLE: StringFlags = StringFlags(0x04);
    /// Fixed size mutable string, writable only via replace().
    pub const MUTABLE_FIXED: StringFlags = StringFlags(0x08);
    /// Interned, deduplicated in the intern pool. Implies FREEZE.
    pub const INTERN: StringFlags = StringFlags(0x10);

    pub fn contains(&self, other: StringFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for StringFlags {
    type Output = StringFlags;

    fn bitor(self, rhs: StringFlags) -> StringFlags {
        StringFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for StringFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StringFlags({:#04x})", self.0)
    }
}

#[derive(Clone, PartialEq)]
struct ZMeta {
    uncompressed_len: usize,
}

/// The string primitive.
///
/// Equality and ordering are byte-lexicographic over the payload;
/// flags and checksums do not participate.
#[derive(Clone)]
pub struct SelvaString {
    flags: StringFlags,
    buf: Vec<u8>,
    fixed_cap: usize,
    crc: u32,
    z: Option<ZMeta>,
}

impl SelvaString {
    /// Create a new string. `MUTABLE` and `MUTABLE_FIXED` are mutually
    /// exclusive; `INTERN` implies `FREEZE`.
    pub fn new(src: &[u8], flags: StringFlags) -> Result<SelvaString> {
        if flags.contains(StringFlags::MUTABLE) && flags.contains(StringFlags::MUTABLE_FIXED) {
            return err_at!(InvalidInput, msg: "conflicting mutability flags");
        }
        let flags = if flags.contains(StringFlags::INTERN) {
            flags | StringFlags::FREEZE
        } else {
            flags
        };
        let fixed_cap = if flags.contains(StringFlags::MUTABLE_FIXED) { src.len() } else { 0 };
        let mut s = SelvaString { flags, buf: src.to_vec(), fixed_cap, crc: 0, z: None };
        s.refresh_crc();
        Ok(s)
    }

    /// Create a string from literal bytes with no flags. Never fails.
    pub fn from_bytes(src: &[u8]) -> SelvaString {
        SelvaString {
            flags: StringFlags::default(),
            buf: src.to_vec(),
            fixed_cap: 0,
            crc: 0,
            z: None,
        }
    }

    /// Create a compressed string. If deflate does not shrink the input
    /// the payload is stored as-is and the string is not marked
    /// compressed. Supported flags: `CRC`, `FREEZE`.
    pub fn new_compressed(src: &[u8], flags: StringFlags) -> Result<SelvaString> {
        if flags.contains(StringFlags::MUTABLE) || flags.contains(StringFlags::MUTABLE_FIXED) {
            return err_at!(InvalidInput, msg: "compressed strings are immutable");
        }
        let z = deflate(src)?;
        let mut s = if z.len() < src.len() {
            SelvaString {
                flags,
                buf: z,
                fixed_cap: 0,
                crc: 0,
                z: Some(ZMeta { uncompressed_len: src.len() }),
            }
        } else {
            SelvaString { flags, buf: src.to_vec(), fixed_cap: 0, crc: 0, z: None }
        };
        s.refresh_crc();
        Ok(s)
    }

    /// Duplicate the payload into a fresh string carrying `flags`.
    pub fn dup(&self, flags: StringFlags) -> Result<SelvaString> {
        SelvaString::new(&self.buf, flags)
    }

    pub fn flags(&self) -> StringFlags {
        self.flags
    }

    pub fn is_mutable(&self) -> bool {
        self.flags.contains(StringFlags::MUTABLE)
            || self.flags.contains(StringFlags::MUTABLE_FIXED)
    }

    pub fn is_compressed(&self) -> bool {
        self.z.is_some()
    }

    /// Uncompressed length; the payload length for plain strings.
    pub fn uncompressed_len(&self) -> usize {
        match &self.z {
            Some(z) => z.uncompressed_len,
            None => self.buf.len(),
        }
    }

    /// Compression ratio in percent of the original size, 100 for plain
    /// strings.
    pub fn compression_ratio(&self) -> usize {
        match &self.z {
            Some(z) if z.uncompressed_len > 0 => (self.buf.len() * 100) / z.uncompressed_len,
            _ => 100,
        }
    }

    /// Inflate a compressed string.
    pub fn decompress(&self) -> Result<Vec<u8>> {
        match &self.z {
            Some(z) => inflate(&self.buf, z.uncompressed_len),
            None => err_at!(TypeMismatch, msg: "not a compressed string"),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_str(&self) -> Result<&str> {
        err_at!(TypeMismatch, std::str::from_utf8(&self.buf))
    }

    /// Mutable view of the payload of a mutable string. A CRC enabled
    /// string must be refreshed with [SelvaString::en_crc] after writing
    /// through this.
    pub fn to_mstr(&mut self) -> Result<&mut [u8]> {
        if !self.is_mutable() {
            return err_at!(NotSupported, msg: "immutable string");
        }
        Ok(&mut self.buf)
    }

    /// Truncate to `newlen`. Only plain mutable strings can shrink.
    pub fn truncate(&mut self, newlen: usize) -> Result<()> {
        if !self.flags.contains(StringFlags::MUTABLE) {
            return err_at!(NotSupported, msg: "immutable string");
        } else if newlen > self.buf.len() {
            return err_at!(InvalidInput, msg: "truncate beyond length {}", newlen);
        }
        self.buf.truncate(newlen);
        self.refresh_crc();
        Ok(())
    }

    /// Append bytes. Only plain mutable strings can grow.
    pub fn append(&mut self, src: &[u8]) -> Result<()> {
        if !self.flags.contains(StringFlags::MUTABLE) {
            return err_at!(NotSupported, msg: "immutable string");
        }
        self.buf.extend_from_slice(src);
        self.refresh_crc();
        Ok(())
    }

    /// Replace the whole payload. Fixed size mutable strings accept at
    /// most their original capacity.
    pub fn replace(&mut self, src: &[u8]) -> Result<()> {
        if self.flags.contains(StringFlags::MUTABLE_FIXED) {
            if src.len() > self.fixed_cap {
                return err_at!(OutOfBuffer, msg: "{} > {}", src.len(), self.fixed_cap);
            }
        } else if !self.flags.contains(StringFlags::MUTABLE) {
            return err_at!(NotSupported, msg: "immutable string");
        }
        self.buf.clear();
        self.buf.extend_from_slice(src);
        self.refresh_crc();
        Ok(())
    }

    pub fn to_i64(&self) -> Result<i64> {
        let s = self.parse_str()?;
        err_at!(RangeError, s.parse::<i64>(), "{:?}", s)
    }

    pub fn to_u64(&self) -> Result<u64> {
        let s = self.parse_str()?;
        err_at!(RangeError, s.parse::<u64>(), "{:?}", s)
    }

    pub fn to_f32(&self) -> Result<f32> {
        let s = self.parse_str()?;
        err_at!(RangeError, s.parse::<f32>(), "{:?}", s)
    }

    pub fn to_f64(&self) -> Result<f64> {
        let s = self.parse_str()?;
        err_at!(RangeError, s.parse::<f64>(), "{:?}", s)
    }

    /// Mark the string permanently shared.
    pub fn freeze(&mut self) {
        self.flags = self.flags | StringFlags::FREEZE;
    }

    /// Enable CRC checking.
    pub fn en_crc(&mut self) {
        self.flags = self.flags | StringFlags::CRC;
        self.refresh_crc();
    }

    /// Verify the payload checksum. Strings without the CRC flag always
    /// verify.
    pub fn verify_crc(&self) -> bool {
        if !self.flags.contains(StringFlags::CRC) {
            return true;
        }
        self.crc == self.compute_crc()
    }

    /// Find a sub-slice within the payload.
    pub fn strstr(&self, sub: &[u8]) -> Option<usize> {
        if sub.is_empty() || sub.len() > self.buf.len() {
            return None;
        }
        self.buf.windows(sub.len()).position(|w| w == sub)
    }

    /// Test-only access to corrupt the payload behind the CRC's back.
    #[cfg(test)]
    pub(crate) fn raw_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    // Decompose for the serialization format: flag bits, the separate
    // compressed tag, uncompressed length and the raw payload.
    pub(crate) fn snapshot_parts(&self) -> (u8, bool, u64, &[u8]) {
        (self.flags.0, self.z.is_some(), self.uncompressed_len() as u64, &self.buf)
    }

    pub(crate) fn from_snapshot_parts(
        flags: u8,
        compressed: bool,
        uncompressed_len: u64,
        data: &[u8],
    ) -> SelvaString {
        let z = if compressed {
            Some(ZMeta { uncompressed_len: uncompressed_len as usize })
        } else {
            None
        };
        let flags = StringFlags(flags);
        let fixed_cap =
            if flags.contains(StringFlags::MUTABLE_FIXED) { data.len() } else { 0 };
        let mut s = SelvaString { flags, buf: data.to_vec(), fixed_cap, crc: 0, z };
        s.refresh_crc();
        s
    }

    fn parse_str(&self) -> Result<&str> {
        let end = self.buf.iter().position(|b| *b == 0).unwrap_or(self.buf.len());
        err_at!(RangeError, std::str::from_utf8(&self.buf[..end]))
    }

    // The checksum covers the flag byte, the payload and the implied
    // nul terminator.
    fn compute_crc(&self) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&[self.flags.0 & !StringFlags::CRC.0]);
        digest.update(&self.buf);
        digest.update(&[0]);
        digest.finalize()
    }

    fn refresh_crc(&mut self) {
        if self.flags.contains(StringFlags::CRC) {
            self.crc = self.compute_crc();
        }
    }
}

impl PartialEq for SelvaString {
    fn eq(&self, other: &SelvaString) -> bool {
        self.buf == other.buf
    }
}

impl Eq for SelvaString {}

impl PartialOrd for SelvaString {
    fn partial_cmp(&self, other: &SelvaString) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SelvaString {
    fn cmp(&self, other: &SelvaString) -> Ordering {
        self.buf.cmp(&other.buf)
    }
}

impl fmt::Debug for SelvaString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.buf))
    }
}

impl fmt::Display for SelvaString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.buf))
    }
}

impl From<&str> for SelvaString {
    fn from(s: &str) -> SelvaString {
        SelvaString::from_bytes(s.as_bytes())
    }
}

/// Intern pool, deduplicating strings by byte equality. One pool lives in
/// the hierarchy root; interned handles stay alive for the lifetime of
/// the pool.
#[derive(Default)]
pub struct InternPool {
    pool: BTreeMap<Vec<u8>, Rc<SelvaString>>,
}

impl InternPool {
    pub fn new() -> InternPool {
        InternPool { pool: BTreeMap::new() }
    }

    /// Intern `src`, returning the existing handle when one exists.
    pub fn intern(&mut self, src: &[u8]) -> Result<Rc<SelvaString>> {
        if let Some(s) = self.pool.get(src) {
            return Ok(Rc::clone(s));
        }
        let s = Rc::new(SelvaString::new(src, StringFlags::INTERN)?);
        self.pool.insert(src.to_vec(), Rc::clone(&s));
        Ok(s)
    }

    /// Find an already interned string.
    pub fn find(&self, src: &[u8]) -> Option<Rc<SelvaString>> {
        self.pool.get(src).map(Rc::clone)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

/// Deflate `data` with the default compression level.
pub(crate) fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut enc =
        flate2::write::ZlibEncoder::new(Vec::with_capacity(data.len()), flate2::Compression::default());
    err_at!(Fatal, enc.write_all(data))?;
    err_at!(Fatal, enc.finish())
}

/// Inflate a deflate stream of unknown uncompressed length.
pub(crate) fn inflate_raw(data: &[u8]) -> Result<Vec<u8>> {
    let mut dec = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    err_at!(InvalidInput, dec.read_to_end(&mut out))?;
    Ok(out)
}

/// Inflate a deflate stream of known uncompressed length.
pub(crate) fn inflate(data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
    let mut dec = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(uncompressed_len);
    err_at!(InvalidInput, dec.read_to_end(&mut out))?;
    if out.len() != uncompressed_len {
        return err_at!(InvalidInput, msg: "length {} != {}", out.len(), uncompressed_len);
    }
    Ok(out)
}

#[cfg(test)]
#[path = "sstring_test.rs"]
mod sstring_test;
