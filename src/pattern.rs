//! Wildcard byte-signature scanning over a loaded image.
//!
//! A signature is compiled once from its textual form and matched by pure
//! byte comparison in a single pass, early-exiting each candidate position on
//! the first mismatched byte. No disassembly is involved; accessors resolve a
//! match to an operand inside the matched sequence via a signed displacement.

use std::cell::OnceCell;

use anyhow::{bail, Result};

/// One byte-matcher: `byte & mask == value`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct SigByte {
    value: u8,
    mask: u8,
}

impl SigByte {
    fn matches(self, byte: u8) -> bool {
        byte & self.mask == self.value
    }
}

/// A compiled signature. Immutable once parsed.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signature {
    bytes: Vec<SigByte>,
}

fn nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => bail!("invalid hex digit {:?}", c as char),
    }
}

impl Signature {
    /// Parses a space-separated hex signature. `?` (or `??`) matches any
    /// byte; a `?` in one position of a two-character token matches any value
    /// of that nibble (`4?` matches `0x40..=0x4F`).
    pub fn parse(text: &str) -> Result<Signature> {
        let mut bytes = Vec::new();
        for token in text.split_ascii_whitespace() {
            let sig = match token.as_bytes() {
                b"?" | b"??" => SigByte { value: 0, mask: 0 },
                [hi, b'?'] => SigByte {
                    value: nibble(*hi)? << 4,
                    mask: 0xF0,
                },
                [b'?', lo] => SigByte {
                    value: nibble(*lo)?,
                    mask: 0x0F,
                },
                [hi, lo] => SigByte {
                    value: (nibble(*hi)? << 4) | nibble(*lo)?,
                    mask: 0xFF,
                },
                _ => bail!("invalid signature token {:?} in {:?}", token, text),
            };
            bytes.push(sig);
        }
        if bytes.is_empty() {
            bail!("empty signature");
        }
        Ok(Signature { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First fully-fixed byte, used to drive the memchr candidate search.
    fn first_fixed(&self) -> Option<(usize, u8)> {
        self.bytes
            .iter()
            .position(|b| b.mask == 0xFF)
            .map(|i| (i, self.bytes[i].value))
    }

    fn matches_at(&self, window: &[u8]) -> bool {
        window
            .iter()
            .zip(&self.bytes)
            .all(|(byte, sig)| sig.matches(*byte))
    }
}

/// The byte range a pattern scans. A match never extends past the end of its
/// region, so scans cannot cross into sections they do not own.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    base: usize,
    len: usize,
}

impl Region {
    /// # Safety
    /// `base..base + len` must stay readable for as long as the region (and
    /// any pattern built on it) is used.
    pub const unsafe fn new(base: usize, len: usize) -> Region {
        Region { base, len }
    }

    /// Region over a caller-owned buffer; valid while the buffer lives.
    pub fn from_slice(bytes: &[u8]) -> Region {
        Region {
            base: bytes.as_ptr() as usize,
            len: bytes.len(),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base as *const u8, self.len)
    }
}

fn scan(sig: &Signature, hay: &[u8], limit: Option<usize>) -> Vec<usize> {
    let mut out = Vec::with_capacity(limit.unwrap_or(0));
    if hay.len() < sig.len() {
        return out;
    }
    let last = hay.len() - sig.len();
    let full = |out: &Vec<usize>| limit.is_some_and(|n| out.len() >= n);
    match sig.first_fixed() {
        Some((index, value)) => {
            for pos in memchr::memchr_iter(value, hay) {
                let Some(start) = pos.checked_sub(index) else {
                    continue;
                };
                if start > last {
                    break;
                }
                if sig.matches_at(&hay[start..start + sig.len()]) {
                    out.push(start);
                    if full(&out) {
                        break;
                    }
                }
            }
        }
        None => {
            // all-wildcard signatures have no anchor byte
            for start in 0..=last {
                if sig.matches_at(&hay[start..start + sig.len()]) {
                    out.push(start);
                    if full(&out) {
                        break;
                    }
                }
            }
        }
    }
    out
}

/// One resolved match location.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Match {
    addr: usize,
}

impl Match {
    pub fn addr(self) -> usize {
        self.addr
    }

    /// Pointer displaced from the match start, for reaching operands embedded
    /// within the matched instruction sequence.
    pub fn get<T>(self, offset: isize) -> *mut T {
        self.addr.wrapping_add_signed(offset) as *mut T
    }
}

/// A signature bound to a scan region. The scan runs once, on the first
/// count assertion or accessor, and the result is cached; repeated accessor
/// calls always see the same addresses.
pub struct Pattern {
    text: String,
    sig: Signature,
    region: Region,
    matches: OnceCell<Vec<usize>>,
}

/// A pattern over the main executable's code section.
#[cfg(windows)]
pub fn pattern(text: &str) -> Result<Pattern> {
    let view = unsafe { crate::image::ImageView::main_module()? };
    let (base, len) = view.code_section()?;
    Pattern::in_region(text, unsafe { Region::new(base, len) })
}

impl Pattern {
    /// A pattern over an explicit byte range.
    pub fn in_region(text: &str, region: Region) -> Result<Pattern> {
        Ok(Pattern {
            text: text.to_string(),
            sig: Signature::parse(text)?,
            region,
            matches: OnceCell::new(),
        })
    }

    fn matches(&self, limit: Option<usize>) -> &[usize] {
        self.matches.get_or_init(|| {
            let hay = unsafe { self.region.bytes() };
            let found: Vec<usize> = scan(&self.sig, hay, limit)
                .into_iter()
                .map(|offset| self.region.base() + offset)
                .collect();
            log::debug!("pattern {:?}: {} match(es)", self.text, found.len());
            found
        })
    }

    /// Asserts the exact match count. Mismatch is fatal: proceeding with the
    /// wrong address would corrupt the host process, so the error is meant to
    /// abort the caller's whole init routine.
    pub fn count(self, expected: usize) -> Result<Pattern> {
        let found = self.matches(Some(expected + 1)).len();
        if found != expected {
            bail!(
                "pattern {:?}: expected {} match(es), found {}",
                self.text,
                expected,
                found
            );
        }
        Ok(self)
    }

    /// Non-fatal expectation; bounds the scan at `expected + 1` candidates so
    /// callers can cheaply test `size() == expected` and skip the patch on
    /// mismatch.
    pub fn count_hint(self, expected: usize) -> Pattern {
        self.matches(Some(expected + 1));
        self
    }

    pub fn size(&self) -> usize {
        self.matches(None).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn get(&self, index: usize) -> Match {
        let matches = self.matches(None);
        assert!(
            index < matches.len(),
            "pattern {:?}: match {} out of range ({} found)",
            self.text,
            index,
            matches.len()
        );
        Match {
            addr: matches[index],
        }
    }

    /// The only match. Panics unless exactly one exists; gate on `size()` or
    /// `count` first.
    pub fn get_one(&self) -> Match {
        let matches = self.matches(None);
        assert!(
            matches.len() == 1,
            "pattern {:?}: expected exactly one match, found {}",
            self.text,
            matches.len()
        );
        Match { addr: matches[0] }
    }

    /// Pointer displaced from the first match.
    pub fn get_first<T>(&self, offset: isize) -> *mut T {
        self.get(0).get(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches_in(text: &str, hay: &[u8]) -> Vec<usize> {
        let base = hay.as_ptr() as usize;
        let pat = Pattern::in_region(text, Region::from_slice(hay)).unwrap();
        (0..pat.size()).map(|i| pat.get(i).addr() - base).collect()
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Signature::parse("").is_err());
        assert!(Signature::parse("   ").is_err());
        assert!(Signature::parse("GG").is_err());
        assert!(Signature::parse("F").is_err());
        assert!(Signature::parse("FFF").is_err());
        assert!(Signature::parse("FF 1").is_err());
    }

    #[test]
    fn parse_wildcards() {
        let sig = Signature::parse("FF ? ?? 4? ?C").unwrap();
        assert_eq!(sig.len(), 5);
        assert!(sig.matches_at(&[0xFF, 0x00, 0xAB, 0x4D, 0x7C]));
        assert!(sig.matches_at(&[0xFF, 0x99, 0x00, 0x40, 0x0C]));
        assert!(!sig.matches_at(&[0xFE, 0x00, 0xAB, 0x4D, 0x7C]));
        assert!(!sig.matches_at(&[0xFF, 0x00, 0xAB, 0x5D, 0x7C]));
        assert!(!sig.matches_at(&[0xFF, 0x00, 0xAB, 0x4D, 0x7D]));
    }

    #[test]
    fn indirect_call_scenario() {
        // FF 15 ? ? ? ? against exactly one indirect call
        let buf = [0xFFu8, 0x15, 0x01, 0x02, 0x03, 0x04];
        let pat = Pattern::in_region("FF 15 ? ? ? ?", Region::from_slice(&buf))
            .unwrap()
            .count(1)
            .unwrap();
        assert_eq!(pat.size(), 1);
        let operand: *mut u8 = pat.get_first(2);
        assert_eq!(operand as usize, buf.as_ptr() as usize + 2);
        assert_eq!(unsafe { *operand }, 0x01);
    }

    #[test]
    fn count_mismatch_is_fatal() {
        let buf = [0x90u8, 0xC3, 0x90, 0xC3];
        let two = Pattern::in_region("90 C3", Region::from_slice(&buf)).unwrap();
        assert!(two.count(1).is_err());
        let zero = Pattern::in_region("C3 C3", Region::from_slice(&buf)).unwrap();
        assert!(zero.count(1).is_err());
        let exact = Pattern::in_region("90 C3", Region::from_slice(&buf)).unwrap();
        assert!(exact.count(2).is_ok());
    }

    #[test]
    fn count_hint_never_fails() {
        let buf = [0x90u8, 0xC3, 0x90, 0xC3];
        let pat = Pattern::in_region("90 C3", Region::from_slice(&buf))
            .unwrap()
            .count_hint(1);
        // hint was wrong; the caller sees that and skips its patch
        assert_eq!(pat.size(), 2);
    }

    #[test]
    fn matches_agree_with_bytewise_predicate() {
        let hay: Vec<u8> = (0..64u32).map(|i| (i * 7 % 256) as u8).collect();
        let sig = Signature::parse("0E ? 1C").unwrap();
        let expected: Vec<usize> = (0..=hay.len() - 3)
            .filter(|&i| hay[i] == 0x0E && hay[i + 2] == 0x1C)
            .collect();
        assert_eq!(matches_in("0E ? 1C", &hay), expected);
        assert!(sig.matches_at(&hay[expected[0]..expected[0] + 3]));
    }

    #[test]
    fn no_match_past_region_end() {
        // the anchor byte matches at the last position but the signature
        // would extend past the region
        let buf = [0x00u8, 0x11, 0xFF];
        assert!(matches_in("FF 15", &buf).is_empty());
    }

    #[test]
    fn wildcard_leading_signature() {
        let buf = [0xAAu8, 0x10, 0xBB, 0x1F, 0xAA, 0x30];
        // no fixed byte at all: windowed scan
        assert_eq!(matches_in("? 1?", &buf), vec![0, 2]);
        // fixed anchor not in first position
        assert_eq!(matches_in("? AA", &buf), vec![3]);
    }

    #[test]
    fn get_first_is_idempotent() {
        let buf = [0xFFu8, 0x15, 0x01, 0x02, 0x03, 0x04];
        let pat = Pattern::in_region("FF 15", Region::from_slice(&buf)).unwrap();
        let first: *mut u8 = pat.get_first(2);
        for _ in 0..3 {
            assert_eq!(pat.get_first::<u8>(2), first);
        }
    }

    #[test]
    #[should_panic(expected = "expected exactly one match")]
    fn get_one_refuses_ambiguity() {
        let buf = [0xC3u8, 0xC3];
        Pattern::in_region("C3", Region::from_slice(&buf))
            .unwrap()
            .get_one();
    }

    #[test]
    fn match_accessors() {
        let buf = [0x00u8, 0xFF, 0x15, 0x00];
        let pat = Pattern::in_region("FF 15", Region::from_slice(&buf)).unwrap();
        let m = pat.get_one();
        assert_eq!(m.addr(), buf.as_ptr() as usize + 1);
        assert_eq!(m.get::<u8>(-1) as usize, buf.as_ptr() as usize);
        assert_eq!(m.get::<u8>(2) as usize, buf.as_ptr() as usize + 3);
    }
}
