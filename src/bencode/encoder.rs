use super::BencodeResult;
use super::BencodeValue;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

// Pairs are written in stored order. Re-sorting here would change the bytes
// that feed the info-hash.
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &[(Vec<u8>, BencodeValue)]) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes a value into the supplied writer.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes a value into a fresh byte vector.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode_value(&mut buffer, value)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder;

    #[test]
    fn encodes_the_canonical_example() {
        let value = BencodeValue::Dict(vec![(
            b"spam".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::String(b"eggs".to_vec()),
                BencodeValue::Integer(67),
            ]),
        )]);
        assert_eq!(encode_to_vec(&value).unwrap(), b"d4:spaml4:eggsi67eee");
        assert_eq!(decoder::decode(b"d4:spaml4:eggsi67eee").unwrap(), value);
    }

    #[test]
    fn does_not_sort_dictionary_keys() {
        let value = BencodeValue::Dict(vec![
            (b"zz".to_vec(), BencodeValue::Integer(1)),
            (b"aa".to_vec(), BencodeValue::Integer(2)),
        ]);
        assert_eq!(encode_to_vec(&value).unwrap(), b"d2:zzi1e2:aai2ee");
    }

    #[test]
    fn round_trips_wire_bytes_exactly() {
        // Keys deliberately out of lexicographic order, as a hostile info
        // dict might be. Bytes must survive decode followed by encode.
        let wire = b"d5:piecei3e4:name3:abc6:lengthi10ee".to_vec();
        let value = decoder::decode(&wire).unwrap();
        assert_eq!(encode_to_vec(&value).unwrap(), wire);
    }

    #[test]
    fn round_trips_every_kind() {
        let value = BencodeValue::List(vec![
            BencodeValue::Integer(-7),
            BencodeValue::String(vec![0, 255, 17]),
            BencodeValue::Dict(vec![(b"k".to_vec(), BencodeValue::List(vec![]))]),
        ]);
        let encoded = encode_to_vec(&value).unwrap();
        assert_eq!(decoder::decode(&encoded).unwrap(), value);
    }
}
