use thiserror::Error;
pub mod decoder;
pub mod encoder;

/**
 * Represents a Bencode value, the data language used for torrent metadata
 * and the ut_metadata extension payloads.
 *
 * The enum contains four variants that represent all possible Bencode data types:
 *
 * 1. String(Vec<u8>):
 *    - Represents a byte string in Bencode
 *    - Stored as raw bytes (Vec<u8>) rather than UTF-8 strings
 *    - Example: "4:spam" in Bencode becomes String(b"spam")
 *
 * 2. Integer(i64):
 *    - Represents a 64-bit signed integer
 *    - Bencode integers are prefixed with 'i' and suffixed with 'e'
 *    - Example: "i42e" in Bencode becomes Integer(42)
 *
 * 3. List(Vec<BencodeValue>):
 *    - Represents an ordered sequence of Bencode values
 *    - Lists are prefixed with 'l' and suffixed with 'e'
 *    - Example: "l4:spami42ee" becomes List([String(b"spam"), Integer(42)])
 *
 * 4. Dict(Vec<(Vec<u8>, BencodeValue)>):
 *    - Represents a key-value mapping where keys are byte strings
 *    - Stored as a sequence of pairs in the order the keys appear on the
 *      wire. Encoding emits the pairs in that same order, so any dictionary
 *      round-trips byte-for-byte. The info dictionary is hashed from its
 *      re-encoding, which only works if the key order survives.
 */
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a dictionary key, returning the first matching value.
    /// Returns None for non-dictionary values as well as missing keys.
    pub fn find(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
