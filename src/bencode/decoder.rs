//! Bencode decoding.
//!
//! The decoder walks a byte slice with an explicit cursor rather than a
//! `Read` stream: the metainfo parser needs to know exactly how many bytes
//! a value consumed (to recover the raw `info` dict for hashing, and to
//! split a ut_metadata piece payload from its trailing opaque data), which
//! a stream-based reader can't report without extra bookkeeping.
use super::{BencodeError, BencodeResult, BencodeValue, Dict};

/// Default ceiling on how many bytes a single decode call will consume.
/// Matches the extended-message payload bound from the wire spec.
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    max_size: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], max_size: usize) -> BencodeResult<Self> {
        if buf.len() > max_size {
            return Err(BencodeError::TooLarge { max: max_size });
        }
        Ok(Self {
            buf,
            pos: 0,
            max_size,
        })
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        let got = self.next()?;
        if got != byte {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}', found '{}'",
                byte as char, got as char
            )));
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> BencodeResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BencodeError::UnexpectedEof)?;
        if end > self.buf.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_until(&mut self, delimiter: u8) -> BencodeResult<&'a [u8]> {
        let start = self.pos;
        loop {
            let b = self.next()?;
            if b == delimiter {
                return Ok(&self.buf[start..self.pos - 1]);
            }
        }
    }
}

fn decode_string<'a>(cur: &mut Cursor<'a>) -> BencodeResult<Vec<u8>> {
    let len_bytes = cur.read_until(b':')?;
    let len_str =
        std::str::from_utf8(len_bytes).map_err(|_| BencodeError::InvalidStringLength)?;
    if len_str.is_empty() || (len_str.len() > 1 && len_str.starts_with('0')) {
        return Err(BencodeError::InvalidStringLength);
    }
    let len: usize = len_str
        .parse()
        .map_err(|_| BencodeError::InvalidStringLength)?;
    if len > cur.max_size {
        return Err(BencodeError::TooLarge { max: cur.max_size });
    }
    Ok(cur.take(len)?.to_vec())
}

fn decode_integer(cur: &mut Cursor) -> BencodeResult<i64> {
    cur.expect(b'i')?;
    let digits = cur.read_until(b'e')?;
    let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
    if s.is_empty() || s == "-" || s == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let unsigned = s.strip_prefix('-').unwrap_or(s);
    if unsigned.len() > 1 && unsigned.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }
    if !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    s.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

fn decode_list(cur: &mut Cursor) -> BencodeResult<Vec<BencodeValue>> {
    cur.expect(b'l')?;
    let mut list = Vec::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            return Ok(list);
        }
        list.push(decode_value(cur)?);
    }
}

fn decode_dict(cur: &mut Cursor) -> BencodeResult<Dict> {
    cur.expect(b'd')?;
    let mut dict = Dict::new();
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            return Ok(dict);
        }
        if !matches!(cur.peek()?, b'0'..=b'9') {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(cur)?;
        let value = decode_value(cur)?;
        dict.insert(key, value);
    }
}

fn decode_value(cur: &mut Cursor) -> BencodeResult<BencodeValue> {
    match cur.peek()? {
        b'0'..=b'9' => decode_string(cur).map(BencodeValue::String),
        b'i' => decode_integer(cur).map(BencodeValue::Integer),
        b'l' => decode_list(cur).map(BencodeValue::List),
        b'd' => decode_dict(cur).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected byte '{}'",
            other as char
        ))),
    }
}

/// Decodes a single bencoded value, requiring the entire input to be
/// consumed. Use [`decode_prefix`] when trailing bytes are expected
/// (announce responses, ut_metadata payloads).
#[tracing::instrument(skip(bytes), level = "trace")]
pub fn decode(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    decode_with_limit(bytes, DEFAULT_MAX_SIZE)
}

/// Same as [`decode`] but with an explicit size ceiling.
pub fn decode_with_limit(bytes: &[u8], max_size: usize) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix_with_limit(bytes, max_size)?;
    if consumed != bytes.len() {
        return Err(BencodeError::InvalidFormat(
            "trailing bytes after a complete value".to_string(),
        ));
    }
    Ok(value)
}

/// Decodes a single bencoded value and reports how many bytes were
/// consumed, leaving the caller free to inspect whatever follows.
#[tracing::instrument(skip(bytes), level = "trace")]
pub fn decode_prefix(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    decode_prefix_with_limit(bytes, DEFAULT_MAX_SIZE)
}

pub fn decode_prefix_with_limit(
    bytes: &[u8],
    max_size: usize,
) -> BencodeResult<(BencodeValue, usize)> {
    let mut cur = Cursor::new(bytes, max_size)?;
    let value = decode_value(&mut cur)?;
    Ok((value, cur.pos))
}

/// Decodes a top-level bencode dictionary, additionally reporting the exact
/// `[start, end)` byte span `target_key`'s value occupied in `bytes`.
///
/// This exists for one reason: the torrent info-hash must be the SHA-1 of
/// the *original* bytes of the `info` dict, not of a value re-encoded from
/// our parsed representation (key order, integer formatting, etc. could
/// differ from what the publisher produced). Capturing the span while we
/// already have the cursor in hand avoids re-deriving it later.
pub fn decode_dict_capturing_span(
    bytes: &[u8],
    target_key: &[u8],
) -> BencodeResult<(Dict, Option<(usize, usize)>)> {
    let mut cur = Cursor::new(bytes, DEFAULT_MAX_SIZE)?;
    cur.expect(b'd')?;
    let mut dict = Dict::new();
    let mut span = None;
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        if !matches!(cur.peek()?, b'0'..=b'9') {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(&mut cur)?;
        let value_start = cur.pos;
        let value = decode_value(&mut cur)?;
        if key == target_key {
            span = Some((value_start, cur.pos));
        }
        dict.insert(key, value);
    }
    Ok((dict, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode;

    #[test]
    fn decodes_strings_integers_lists_dicts() {
        assert_eq!(
            decode(b"4:spam").unwrap(),
            BencodeValue::String(b"spam".to_vec())
        );
        assert_eq!(decode(b"i42e").unwrap(), BencodeValue::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), BencodeValue::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), BencodeValue::Integer(0));
        assert_eq!(
            decode(b"l4:spam4:eggse").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::String(b"spam".to_vec()),
                BencodeValue::String(b"eggs".to_vec()),
            ])
        );
        let mut d = Dict::new();
        d.insert(b"cow".to_vec(), BencodeValue::String(b"moo".to_vec()));
        d.insert(b"spam".to_vec(), BencodeValue::String(b"eggs".to_vec()));
        assert_eq!(
            decode(b"d3:cow3:moo4:spam4:eggse").unwrap(),
            BencodeValue::Dict(d)
        );
    }

    #[test]
    fn rejects_leading_zero_integers() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_unterminated_values() {
        assert!(decode(b"i42").is_err());
        assert!(decode(b"4:sp").is_err());
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d3:cow3:moo").is_err());
    }

    #[test]
    fn rejects_non_string_dict_key() {
        assert!(decode(b"di1ei2ee").is_err());
    }

    #[test]
    fn decode_prefix_reports_consumed_length_and_leaves_trailer() {
        let mut buf = b"i42e".to_vec();
        buf.extend_from_slice(b"trailing-binary-junk");
        let (value, consumed) = decode_prefix(&buf).unwrap();
        assert_eq!(value, BencodeValue::Integer(42));
        assert_eq!(consumed, 4);
        assert_eq!(&buf[consumed..], b"trailing-binary-junk");
    }

    #[test]
    fn round_trip_decode_encode() {
        let inputs: &[&[u8]] = &[
            b"4:spam",
            b"i42e",
            b"i-42e",
            b"i0e",
            b"l4:spam4:eggse",
            b"d3:cow3:moo4:spam4:eggse",
            b"lli1ei2eel3:abc3:defee",
        ];
        for input in inputs {
            let value = decode(input).unwrap();
            let mut out = Vec::new();
            encode(&mut out, &value).unwrap();
            assert_eq!(&out, input);
        }
    }

    #[test]
    fn oversized_string_is_rejected() {
        let err = decode_with_limit(b"10:abc", 4).unwrap_err();
        assert!(matches!(err, BencodeError::TooLarge { .. }));
    }
}
