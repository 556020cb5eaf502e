//! Magnet link and tracker URL parsing.
//!
//! A magnet link carries just enough to join a swarm without the manifest:
//! the info-hash (`xt=urn:btih:<40 hex>`), a display name (`dn`), and any
//! number of tracker URLs (`tr`). The manifest itself is then fetched from
//! peers via the metadata extension.
use super::TorrentError;
use super::TorrentResult;
use url::Url;

const BTIH_PREFIX: &str = "urn:btih:";

#[derive(Debug, PartialEq, Clone)]
pub struct MagnetLink {
    pub name: String,
    pub info_hash: [u8; 20],
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /**
    Parses a `magnet:?` URI.

    # How it works:
    1. Hands the URI to the `url` crate, which percent-decodes the query
       pairs.
    2. `xt` must be `urn:btih:` followed by 40 hex digits; the digits decode
       to the 20-byte info-hash.
    3. `dn` becomes the display name.
    4. Every `tr` parameter is collected, in order of appearance.
    */
    #[tracing::instrument(level = "debug")]
    pub fn parse(uri: &str) -> TorrentResult<MagnetLink> {
        if !uri.starts_with("magnet:?") {
            return Err(TorrentError::InvalidFormat(format!(
                "not a magnet link: {uri:?}"
            )));
        }
        let url = Url::parse(uri)?;

        let mut name = None;
        let mut info_hash = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => info_hash = Some(parse_btih(&value)?),
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        Ok(MagnetLink {
            name: name.ok_or_else(|| TorrentError::MissingField("dn".to_string()))?,
            info_hash: info_hash.ok_or_else(|| TorrentError::MissingField("xt".to_string()))?,
            trackers,
        })
    }

    /// Rebuilds the URI this link came from, percent-escaping as needed.
    pub fn to_uri(&self) -> String {
        let mut uri = format!(
            "magnet:?xt={}{}&dn={}",
            BTIH_PREFIX,
            hex::encode(self.info_hash),
            escape(&self.name)
        );
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&escape(tracker));
        }
        uri
    }
}

fn parse_btih(urn: &str) -> TorrentResult<[u8; 20]> {
    let hex_digits = urn
        .strip_prefix(BTIH_PREFIX)
        .ok_or_else(|| TorrentError::InvalidFormat(format!("unsupported xt urn: {urn:?}")))?;
    let bytes = hex::decode(hex_digits)
        .map_err(|e| TorrentError::InvalidFormat(format!("bad info-hash hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| TorrentError::InvalidFormat("info-hash is not 20 bytes".to_string()))
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Splits a `udp://host:port[/...]` tracker URL into host and port.
///
/// Only UDP trackers are spoken here; any other scheme is refused rather
/// than silently skipped so callers can report it.
pub fn parse_tracker_url(raw: &str) -> TorrentResult<(String, u16)> {
    let url = Url::parse(raw)?;
    if url.scheme() != "udp" {
        return Err(TorrentError::UnsupportedScheme(raw.to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| TorrentError::InvalidFormat(format!("tracker URL has no host: {raw:?}")))?;
    let port = url
        .port()
        .ok_or_else(|| TorrentError::InvalidFormat(format!("tracker URL has no port: {raw:?}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_HEX: &str = "0101010101010101010101010101010101010101";

    #[test]
    fn parses_a_full_magnet_link() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HASH_HEX}&dn=debian%2Diso&tr=udp%3A%2F%2Ft1.example%3A6969&tr=udp%3A%2F%2Ft2.example%3A80%2F"
        );
        let link = MagnetLink::parse(&uri).unwrap();
        assert_eq!(link.name, "debian-iso");
        assert_eq!(link.info_hash, [1u8; 20]);
        assert_eq!(
            link.trackers,
            vec!["udp://t1.example:6969", "udp://t2.example:80/"]
        );
    }

    #[test]
    fn uri_round_trip_preserves_tracker_order() {
        let link = MagnetLink {
            name: "a file".to_string(),
            info_hash: [0xab; 20],
            trackers: vec![
                "udp://z.example:1".to_string(),
                "udp://a.example:2".to_string(),
            ],
        };
        assert_eq!(MagnetLink::parse(&link.to_uri()).unwrap(), link);
    }

    #[test]
    fn rejects_non_magnet_and_bad_hashes() {
        assert!(MagnetLink::parse("http://example.com").is_err());
        let short = "magnet:?xt=urn:btih:abcd&dn=x";
        assert!(matches!(
            MagnetLink::parse(short),
            Err(TorrentError::InvalidFormat(_))
        ));
        let missing_dn = format!("magnet:?xt=urn:btih:{HASH_HEX}");
        assert!(matches!(
            MagnetLink::parse(&missing_dn),
            Err(TorrentError::MissingField(_))
        ));
    }

    #[test]
    fn tracker_url_must_be_udp() {
        assert_eq!(
            parse_tracker_url("udp://tracker.example:6969/").unwrap(),
            ("tracker.example".to_string(), 6969)
        );
        assert!(matches!(
            parse_tracker_url("http://tracker.example:6969/announce"),
            Err(TorrentError::UnsupportedScheme(_))
        ));
        assert!(parse_tracker_url("udp://tracker.example").is_err());
    }
}
