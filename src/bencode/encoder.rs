//! Bencode encoding. Always canonical: dictionary keys are sorted
//! lexicographically by their raw bytes regardless of the order they were
//! inserted in, matching what the info-hash computation requires.
use super::{BencodeResult, BencodeValue, Dict};
use std::io::Write;

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_dict<W: Write>(writer: &mut W, dict: &Dict) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    let mut entries: Vec<(&Vec<u8>, &BencodeValue)> = dict.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (key, value) in entries {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a value into its canonical bencode byte representation.
#[tracing::instrument(skip(writer, value), level = "trace")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper returning an owned `Vec<u8>`.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_dict_keys_on_encode_regardless_of_insertion_order() {
        let mut dict = Dict::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let out = encode_to_vec(&BencodeValue::Dict(dict)).unwrap();
        assert_eq!(out, b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn encodes_all_four_types() {
        assert_eq!(
            encode_to_vec(&BencodeValue::String(b"spam".to_vec())).unwrap(),
            b"4:spam"
        );
        assert_eq!(
            encode_to_vec(&BencodeValue::Integer(-42)).unwrap(),
            b"i-42e"
        );
        assert_eq!(
            encode_to_vec(&BencodeValue::List(vec![BencodeValue::Integer(1)])).unwrap(),
            b"li1ee"
        );
    }
}
