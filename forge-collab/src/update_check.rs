//! Structural check of v1-encoded updates and state vectors.
//!
//! `yrs` trusts the bytes it decodes: string contents are read without UTF-8
//! validation and length prefixes size allocations up front. Everything that
//! reaches [`crate::document::DocumentStore`] from the network is walked here
//! first, so a corrupted or hostile frame is rejected as malformed instead of
//! reaching the decoder.
//!
//! ```text
//! update       := blocks delete_set
//! blocks       := n_clients { n_blocks client clock block* }
//! block        := info (GC len | Skip len | item)
//! item         := [origin] [right_origin] [parent [parent_sub]] content
//! delete_set   := n_clients { client n_ranges { clock len }* }
//! state_vector := n_clients { client clock }*
//! ```

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const CONTENT_MASK: u8 = 0b0001_1111;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;

const TYPE_XML_ELEMENT: u64 = 3;
const TYPE_XML_HOOK: u64 = 5;
const TYPE_MAX_KNOWN: u64 = 6;

/// Nesting limit for `Any` values (objects and arrays).
pub const MAX_ANY_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpdateFormatError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("variable-length integer overflows at byte {0}")]
    IntOverflow(usize),
    #[error("invalid UTF-8 in string at byte {0}")]
    InvalidUtf8(usize),
    #[error("unknown block info {info:#04x} at byte {pos}")]
    UnknownBlock { info: u8, pos: usize },
    #[error("unknown type ref {type_ref} at byte {pos}")]
    UnknownTypeRef { type_ref: u64, pos: usize },
    #[error("unknown value tag {tag} at byte {pos}")]
    UnknownValueTag { tag: u8, pos: usize },
    #[error("values nested deeper than {MAX_ANY_DEPTH} at byte {0}")]
    TooDeep(usize),
    #[error("zero-length block at byte {0}")]
    EmptyBlock(usize),
    #[error("clock range overflows at byte {0}")]
    ClockOverflow(usize),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Check that `bytes` is one well-formed v1 update and nothing more.
pub fn check_update(bytes: &[u8]) -> Result<(), UpdateFormatError> {
    let mut r = Reader::new(bytes);
    check_blocks(&mut r)?;
    check_delete_set(&mut r)?;
    r.finish()
}

/// Check that `bytes` is one well-formed v1 state vector and nothing more.
pub fn check_state_vector(bytes: &[u8]) -> Result<(), UpdateFormatError> {
    let mut r = Reader::new(bytes);
    let clients = r.var_u32()?;
    for _ in 0..clients {
        r.var_u64()?;
        r.var_u32()?;
    }
    r.finish()
}

fn check_blocks(r: &mut Reader<'_>) -> Result<(), UpdateFormatError> {
    let clients = r.var_u32()?;
    for _ in 0..clients {
        let blocks = r.var_u32()?;
        r.var_u64()?;
        let mut clock = u64::from(r.var_u32()?);
        for _ in 0..blocks {
            let start = r.pos;
            clock += check_block(r)?;
            if clock > u64::from(u32::MAX) {
                return Err(UpdateFormatError::ClockOverflow(start));
            }
        }
    }
    Ok(())
}

/// Walk one block and return its clock length.
fn check_block(r: &mut Reader<'_>) -> Result<u64, UpdateFormatError> {
    let pos = r.pos;
    let info = r.u8()?;
    let content = info & CONTENT_MASK;

    if content == BLOCK_GC || content == BLOCK_SKIP {
        if info != content {
            return Err(UpdateFormatError::UnknownBlock { info, pos });
        }
        return nonzero(u64::from(r.var_u32()?), pos);
    }

    if info & HAS_ORIGIN != 0 {
        r.id()?;
    }
    if info & HAS_RIGHT_ORIGIN != 0 {
        r.id()?;
    }
    if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
        if r.var_u32()? == 1 {
            r.string()?;
        } else {
            r.id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            r.string()?;
        }
    }

    match content {
        CONTENT_DELETED => nonzero(u64::from(r.var_u32()?), pos),
        CONTENT_JSON => {
            let count = r.var_u32()?;
            for _ in 0..count {
                r.string()?;
            }
            nonzero(u64::from(count), pos)
        }
        CONTENT_BINARY => {
            r.buf()?;
            Ok(1)
        }
        CONTENT_STRING => {
            let s = r.string()?;
            nonzero(s.encode_utf16().count() as u64, pos)
        }
        CONTENT_EMBED => {
            r.string()?;
            Ok(1)
        }
        CONTENT_FORMAT => {
            r.string()?;
            r.string()?;
            Ok(1)
        }
        CONTENT_TYPE => {
            let at = r.pos;
            let type_ref = r.var_u64()?;
            if type_ref > TYPE_MAX_KNOWN {
                return Err(UpdateFormatError::UnknownTypeRef { type_ref, pos: at });
            }
            if type_ref == TYPE_XML_ELEMENT || type_ref == TYPE_XML_HOOK {
                r.string()?;
            }
            Ok(1)
        }
        CONTENT_ANY => {
            let count = r.var_u32()?;
            for _ in 0..count {
                check_any(r, 0)?;
            }
            nonzero(u64::from(count), pos)
        }
        CONTENT_DOC => {
            r.string()?;
            check_any(r, 0)?;
            Ok(1)
        }
        _ => Err(UpdateFormatError::UnknownBlock { info, pos }),
    }
}

fn check_any(r: &mut Reader<'_>, depth: usize) -> Result<(), UpdateFormatError> {
    let pos = r.pos;
    if depth > MAX_ANY_DEPTH {
        return Err(UpdateFormatError::TooDeep(pos));
    }
    match r.u8()? {
        // undefined, null, false, true
        127 | 126 | 121 | 120 => Ok(()),
        // signed var int
        125 => r.var_int(),
        124 => r.skip(4),
        123 | 122 => r.skip(8),
        119 => r.string().map(|_| ()),
        118 => {
            let len = r.var_u32()?;
            for _ in 0..len {
                r.string()?;
                check_any(r, depth + 1)?;
            }
            Ok(())
        }
        117 => {
            let len = r.var_u32()?;
            for _ in 0..len {
                check_any(r, depth + 1)?;
            }
            Ok(())
        }
        116 => r.buf(),
        tag => Err(UpdateFormatError::UnknownValueTag { tag, pos }),
    }
}

fn check_delete_set(r: &mut Reader<'_>) -> Result<(), UpdateFormatError> {
    let clients = r.var_u32()?;
    for _ in 0..clients {
        r.var_u64()?;
        let ranges = r.var_u32()?;
        for _ in 0..ranges {
            let pos = r.pos;
            let clock = r.var_u32()?;
            let len = r.var_u32()?;
            if len == 0 {
                return Err(UpdateFormatError::EmptyBlock(pos));
            }
            if clock.checked_add(len).is_none() {
                return Err(UpdateFormatError::ClockOverflow(pos));
            }
        }
    }
    Ok(())
}

fn nonzero(len: u64, pos: usize) -> Result<u64, UpdateFormatError> {
    if len == 0 {
        Err(UpdateFormatError::EmptyBlock(pos))
    } else {
        Ok(len)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, UpdateFormatError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(UpdateFormatError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], UpdateFormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(UpdateFormatError::UnexpectedEnd(self.bytes.len()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), UpdateFormatError> {
        self.take(len).map(|_| ())
    }

    fn var_u64(&mut self) -> Result<u64, UpdateFormatError> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.u8()?;
            let bits = u64::from(b & 0x7f);
            if (shift == 63 && bits > 1) || shift > 63 {
                return Err(UpdateFormatError::IntOverflow(start));
            }
            value |= bits << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn var_u32(&mut self) -> Result<u32, UpdateFormatError> {
        let start = self.pos;
        let value = self.var_u64()?;
        u32::try_from(value).map_err(|_| UpdateFormatError::IntOverflow(start))
    }

    /// Signed lib0 var int: 6 value bits plus sign in the first byte.
    fn var_int(&mut self) -> Result<(), UpdateFormatError> {
        let start = self.pos;
        let mut b = self.u8()?;
        let mut read = 1;
        while b & 0x80 != 0 {
            if read == 10 {
                return Err(UpdateFormatError::IntOverflow(start));
            }
            b = self.u8()?;
            read += 1;
        }
        Ok(())
    }

    fn id(&mut self) -> Result<(), UpdateFormatError> {
        self.var_u64()?;
        self.var_u32()?;
        Ok(())
    }

    fn buf(&mut self) -> Result<(), UpdateFormatError> {
        let len = self.var_u64()?;
        let len = usize::try_from(len).map_err(|_| UpdateFormatError::UnexpectedEnd(self.bytes.len()))?;
        self.skip(len)
    }

    fn string(&mut self) -> Result<&'a str, UpdateFormatError> {
        let len = self.var_u64()?;
        let start = self.pos;
        let len = usize::try_from(len).map_err(|_| UpdateFormatError::UnexpectedEnd(self.bytes.len()))?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| UpdateFormatError::InvalidUtf8(start))
    }

    fn finish(&self) -> Result<(), UpdateFormatError> {
        match self.bytes.len() - self.pos {
            0 => Ok(()),
            n => Err(UpdateFormatError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::encoder::Encode;
    use yrs::{Array, Doc, GetString, Map, ReadTxn, Text, Transact, WriteTxn};

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        txn.encode_update_v1()
    }

    #[test]
    fn test_real_updates_pass() {
        check_update(&text_update("fn main() {}")).unwrap();
        check_update(&text_update("héllo wörld ✓")).unwrap();

        let doc = Doc::new();
        let text = doc.get_or_insert_text("content");
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, "abcdef");
            text.remove_range(&mut txn, 1, 3);
        }
        let full = doc.transact().encode_state_as_update_v1(&Default::default());
        check_update(&full).unwrap();
        assert_eq!(text.get_string(&doc.transact()), "aef");

        let sv = doc.transact().state_vector().encode_v1();
        check_state_vector(&sv).unwrap();
    }

    #[test]
    fn test_structured_values_pass() {
        let doc = Doc::new();
        let mut txn = doc.transact_mut();
        let map = txn.get_or_insert_map("meta");
        map.insert(&mut txn, "lang", "rust");
        map.insert(&mut txn, "line", 42i64);
        map.insert(&mut txn, "ratio", 0.5f64);
        let list = txn.get_or_insert_array("tags");
        list.insert(&mut txn, 0, true);
        list.insert(&mut txn, 1, "x");
        check_update(&txn.encode_update_v1()).unwrap();
    }

    #[test]
    fn test_invalid_utf8_string_rejected() {
        let mut update = text_update("abcd");
        let pos = update.windows(4).position(|w| w == b"abcd").unwrap();
        update[pos + 1] = 0xFF;
        assert_eq!(check_update(&update), Err(UpdateFormatError::InvalidUtf8(pos)));
    }

    #[test]
    fn test_truncated_update_rejected() {
        let update = text_update("truncate me");
        for len in 0..update.len() {
            assert!(check_update(&update[..len]).is_err(), "prefix of {len} bytes accepted");
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut update = text_update("x");
        update.push(0);
        assert_eq!(check_update(&update), Err(UpdateFormatError::TrailingBytes(1)));
    }

    #[test]
    fn test_huge_counts_rejected_without_allocating() {
        // 2^32 - 1 clients declared, none present.
        let update = [0xFF, 0xFF, 0xFF, 0xFF, 0x0F];
        assert!(matches!(check_update(&update), Err(UpdateFormatError::UnexpectedEnd(_))));
        assert!(matches!(check_state_vector(&update), Err(UpdateFormatError::UnexpectedEnd(_))));

        let too_big = [0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        assert_eq!(check_state_vector(&too_big), Err(UpdateFormatError::IntOverflow(0)));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        // One client, one Any item parented at root "m", holding nested arrays.
        let mut update = vec![1, 1, 7, 0, CONTENT_ANY, 1, 1, b'm', 1];
        update.extend(std::iter::repeat([117, 1]).take(MAX_ANY_DEPTH + 2).flatten());
        update.push(126);
        update.push(0);
        assert!(matches!(check_update(&update), Err(UpdateFormatError::TooDeep(_))));
    }

    #[test]
    fn test_unknown_block_rejected() {
        let update = [1, 1, 7, 0, 0x1F, 1, 1, b'm', 0];
        assert!(matches!(check_update(&update), Err(UpdateFormatError::UnknownBlock { .. })));
    }
}
