use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use tracing::instrument;

/// Decodes a complete bencode value.
///
/// The whole input must be consumed: any bytes remaining after the first
/// value make the input malformed at the top level.
///
/// # Arguments
/// * `input` - The raw bencoded bytes
///
/// # Returns
/// * `BencodeResult<BencodeValue>` - The decoded value, or an error if the
///   input is truncated, carries an unknown leading tag, or has trailing
///   bytes after the first value.
#[instrument(skip(input), level = "debug")]
pub fn decode(input: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, rest) = decode_prefix(input)?;
    if !rest.is_empty() {
        return Err(BencodeError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Decodes one bencode value from the front of `input` and returns the
/// unconsumed tail.
///
/// The tail is meaningful to callers: ut_metadata data frames are a bencode
/// dictionary immediately followed by raw piece bytes, and the piece bytes
/// are exactly the returned remainder.
#[instrument(skip(input), level = "trace")]
pub fn decode_prefix(input: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    let first = *input.first().ok_or(BencodeError::UnexpectedEOI)?;
    match first {
        b'0'..=b'9' => {
            let (s, rest) = decode_string(input)?;
            Ok((BencodeValue::String(s), rest))
        }
        b'i' => {
            let (i, rest) = decode_integer(input)?;
            Ok((BencodeValue::Integer(i), rest))
        }
        b'l' => decode_list(input),
        b'd' => decode_dict(input),
        _ => Err(BencodeError::InvalidFormat(format!(
            "Unexpected leading byte: 0x{first:02x}"
        ))),
    }
}

/// Decodes a bencode string in the format `<length>:<data>` where:
/// - `<length>` is a decimal number indicating the length of the string
/// - `<data>` is the actual string data of the specified length
///
/// # Example
/// For input "5:hello", this function returns the bytes of "hello" and an
/// empty remainder.
fn decode_string(input: &[u8]) -> BencodeResult<(Vec<u8>, &[u8])> {
    let (length_str, rest) = split_at_delimiter(input, b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    if rest.len() < length {
        return Err(BencodeError::UnexpectedEOI);
    }
    Ok((rest[..length].to_vec(), &rest[length..]))
}

/// Splits `input` at the first occurrence of `delimiter`, returning the
/// bytes before it (as UTF-8, since they always spell a decimal number)
/// and the bytes after it.
fn split_at_delimiter(input: &[u8], delimiter: u8) -> BencodeResult<(String, &[u8])> {
    let index = input
        .iter()
        .position(|&b| b == delimiter)
        .ok_or(BencodeError::UnexpectedEOI)?;

    let head = String::from_utf8(input[..index].to_vec()).map_err(|e| {
        BencodeError::InvalidFormat(format!("Non-UTF8 characters in length/integer: {}", e))
    })?;
    Ok((head, &input[index + 1..]))
}

/// Decodes a bencode integer in the format `i<number>e`.
///
/// The function performs several validations:
/// - Ensures the integer starts with 'i'
/// - Rejects leading zeros (except for single '0')
/// - Rejects "-0" as invalid
/// - Rejects empty integers
///
/// # Example
/// For input "i42e", this function returns 42 and an empty remainder.
fn decode_integer(input: &[u8]) -> BencodeResult<(i64, &[u8])> {
    let rest = match input.first() {
        Some(b'i') => &input[1..],
        Some(_) => {
            return Err(BencodeError::InvalidFormat(
                "Integer must start with 'i'".to_string(),
            ));
        }
        None => return Err(BencodeError::UnexpectedEOI),
    };

    let (num_str, rest) = split_at_delimiter(rest, b'e')?;

    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }

    let value = num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)?;
    Ok((value, rest))
}

/// Decodes a bencode list in the format `l<items>e`, recursively decoding
/// each item with `decode_prefix`.
fn decode_list(input: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    debug_assert_eq!(input.first(), Some(&b'l'));
    let mut rest = &input[1..];

    let mut list = Vec::new();
    loop {
        match rest.first() {
            Some(b'e') => return Ok((BencodeValue::List(list), &rest[1..])),
            Some(_) => {
                let (item, tail) = decode_prefix(rest)?;
                list.push(item);
                rest = tail;
            }
            None => return Err(BencodeError::UnexpectedEOI),
        }
    }
}

/// Decodes a bencode dictionary in the format `d<key1><value1>...e`.
///
/// Keys must be strings. The pairs are kept in wire order; nothing here (or
/// in the encoder) sorts them.
fn decode_dict(input: &[u8]) -> BencodeResult<(BencodeValue, &[u8])> {
    debug_assert_eq!(input.first(), Some(&b'd'));
    let mut rest = &input[1..];

    let mut pairs = Vec::new();
    loop {
        match rest.first() {
            Some(b'e') => return Ok((BencodeValue::Dict(pairs), &rest[1..])),
            Some(b'0'..=b'9') => {
                let (key, tail) = decode_string(rest)?;
                let (value, tail) = decode_prefix(tail)?;
                pairs.push((key, value));
                rest = tail;
            }
            Some(_) => {
                return Err(BencodeError::InvalidFormat(
                    "Dictionary key is not a string".to_string(),
                ));
            }
            None => return Err(BencodeError::UnexpectedEOI),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> BencodeValue {
        BencodeValue::String(s.as_bytes().to_vec())
    }

    #[test]
    fn decodes_scalars() {
        assert_eq!(decode(b"i123e").unwrap(), BencodeValue::Integer(123));
        assert_eq!(decode(b"i-45e").unwrap(), BencodeValue::Integer(-45));
        assert_eq!(decode(b"4:spam").unwrap(), bytes("spam"));
        assert_eq!(decode(b"0:").unwrap(), bytes(""));
    }

    #[test]
    fn decodes_nested_containers() {
        let value = decode(b"d4:spaml4:eggsi67eee").unwrap();
        assert_eq!(
            value,
            BencodeValue::Dict(vec![(
                b"spam".to_vec(),
                BencodeValue::List(vec![bytes("eggs"), BencodeValue::Integer(67)]),
            )])
        );
    }

    #[test]
    fn preserves_dict_key_order() {
        let value = decode(b"d1:bi1e1:ai2ee").unwrap();
        let dict = value.as_dict().unwrap();
        assert_eq!(dict[0].0, b"b".to_vec());
        assert_eq!(dict[1].0, b"a".to_vec());
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(matches!(
            decode(b"i1e4:spam"),
            Err(BencodeError::TrailingBytes(6))
        ));
    }

    #[test]
    fn prefix_decode_reports_tail() {
        let (value, rest) = decode_prefix(b"d1:xi0eeRAWDATA").unwrap();
        assert_eq!(
            value,
            BencodeValue::Dict(vec![(b"x".to_vec(), BencodeValue::Integer(0))])
        );
        assert_eq!(rest, b"RAWDATA");
    }

    #[test]
    fn rejects_truncation_and_bad_tags() {
        assert!(matches!(decode(b"i12"), Err(BencodeError::UnexpectedEOI)));
        assert!(matches!(decode(b"5:ab"), Err(BencodeError::UnexpectedEOI)));
        assert!(matches!(decode(b"l4:spam"), Err(BencodeError::UnexpectedEOI)));
        assert!(matches!(decode(b"x"), Err(BencodeError::InvalidFormat(_))));
        assert!(matches!(decode(b""), Err(BencodeError::UnexpectedEOI)));
    }

    #[test]
    fn rejects_bad_integers() {
        assert!(matches!(decode(b"i01e"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::InvalidInteger)));
        assert!(matches!(decode(b"ie"), Err(BencodeError::InvalidInteger)));
    }

    #[test]
    fn rejects_non_numeric_length() {
        assert!(matches!(
            decode(b"d3:fooxe"),
            Err(BencodeError::InvalidFormat(_))
        ));
    }
}
