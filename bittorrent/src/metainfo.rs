use serde_derive::{Deserialize, Serialize};
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("torrent has no length")]
    NoLength,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // File name.
    pub name: String,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Length of the file in bytes.
    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,

    // If set to 1 the client must only use the trackers in the metainfo.
    #[serde(default)]
    pub private: Option<u8>,

}

impl Info {
    // Sha1 of the canonically re-encoded info dict. Key ordering matters here,
    // the digest authenticates the whole swarm.
    fn info_hash(&self) -> Result<ID, MetaInfoError> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        let info_data = bencode::encode_to_raw(&self)?;
        hasher.update(info_data);
        Ok(hasher.finalize().into())
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // The announce URL of the primary tracker.
    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    pub info_hash: ID,

    // Whether the pieces blob matched the expected count; when false, per-piece
    // verification is disabled and any fully written piece is accepted.
    #[serde(skip)]
    verify_pieces: bool,

    // Tiered tracker list extension, flattened preserving order when used.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(default)]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        let mut metainfo: MetaInfo = bencode::decode_bytes(raw)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.length == 0 {
            return Err(MetaInfoError::NoLength);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;

        // A mismatched pieces count is tolerated: the download proceeds but
        // accepts any block that writes successfully.
        let expected = (metainfo.info.length + metainfo.info.piece_length as u64 - 1)
            / metainfo.info.piece_length as u64;
        metainfo.verify_pieces = metainfo.info.pieces.len() as u64 == 20 * expected;
        if !metainfo.verify_pieces {
            tracing::warn!(
                "pieces blob holds {} hashes, expected {}; piece verification disabled",
                metainfo.info.pieces.len() / 20,
                expected,
            );
        }

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    // None when verification is disabled by a malformed pieces blob.
    pub fn piece_hashes(&self) -> Option<Vec<ID>> {
        if !self.verify_pieces {
            return None;
        }
        Some(
            self.info.pieces
                .chunks_exact(20)
                // Safe as we have already checked length is a multiple of 20, in new.
                .map(|c| c.try_into().unwrap())
                .collect()
        )
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize {
        ((self.info.length + self.info.piece_length as u64 - 1) / self.info.piece_length as u64) as usize
    }

    pub fn total_len(&self) -> u64 { self.info.length }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Announce URLs in failover order: the tiered list flattened preserving
    // order when present, otherwise just the announce key.
    pub fn announce_urls(&self) -> Vec<url::Url> {
        if let Some(announce_list) = &self.announce_list {
            announce_list.iter().flatten().cloned().collect()
        } else {
            vec![self.announce.clone()]
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("md5sum", &self.md5sum)
            .field("private", &self.private)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::Digest;

    fn sample() -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce25:http://t.example/announce4:infod6:lengthi12345e4:name11:archivo.txt12:piece lengthi16384e6:pieces20:");
        raw.extend_from_slice(&[0u8; 20]);
        raw.extend_from_slice(b"ee");
        raw
    }

    #[test]
    fn test_round_trip_and_info_hash() {
        let raw = sample();

        // The document re-encodes byte-identical through the value tree.
        let tree = bencode::Value::decode(&raw).unwrap();
        assert_eq!(tree.to_bytes().unwrap(), raw);

        // The canonical re-encoding of the info dict hashes to the info-hash.
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();
        let info_raw = tree.get(b"info").unwrap().to_bytes().unwrap();
        let mut hasher = sha1::Sha1::new();
        hasher.update(&info_raw);
        let expect: ID = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expect);
    }

    #[test]
    fn test_geometry() {
        let metainfo = MetaInfo::from_bytes(&sample()).unwrap();
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.piece_len(), 16384);
        assert_eq!(metainfo.total_len(), 12345);
        assert_eq!(metainfo.name(), "archivo.txt");
        assert_eq!(metainfo.announce_urls().len(), 1);
        assert!(metainfo.piece_hashes().is_some());
    }

    #[test]
    fn test_bad_pieces_count_disables_verification() {
        // Two hashes for a one-piece torrent.
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce25:http://t.example/announce4:infod6:lengthi12345e4:name11:archivo.txt12:piece lengthi16384e6:pieces40:");
        raw.extend_from_slice(&[0u8; 40]);
        raw.extend_from_slice(b"ee");
        let metainfo = MetaInfo::from_bytes(&raw).unwrap();
        assert!(metainfo.piece_hashes().is_none());
    }

    #[test]
    fn test_announce_list_flattened_in_order() {
        let raw = b"d8:announce25:http://t.example/announce13:announce-listll26:http://t1.example/announceel26:http://t2.example/announce26:http://t3.example/announceee4:infod6:lengthi1e4:name1:a12:piece lengthi16384e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";
        let metainfo = MetaInfo::from_bytes(raw).unwrap();
        let urls: Vec<String> = metainfo.announce_urls().iter().map(|u| u.to_string()).collect();
        assert_eq!(urls, vec![
            "http://t1.example/announce",
            "http://t2.example/announce",
            "http://t3.example/announce",
        ]);
    }
}
