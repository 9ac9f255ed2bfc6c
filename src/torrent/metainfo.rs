//! Parsing of the torrent descriptor (the `.torrent` file) into a
//! [`Metainfo`]: trackers, piece hashes, and the file layout.
use crate::bencode::decoder::decode_dict_capturing_span;
use crate::bencode::BencodeValue;
use crate::torrent::info_hash::compute_info_hash;
use crate::torrent::piece::PieceInfo;
use crate::torrent::{TorrentError, TorrentResult};
use std::path::{Path, PathBuf};

/// One file within the torrent's concatenated logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub start_byte: u64,
    pub end_byte: u64,
}

/// A parsed torrent descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileInfo>,
    pub total_size: u64,
    pub trackers: Vec<String>,
}

impl Metainfo {
    /// Parses a torrent descriptor from its raw bencoded bytes.
    #[tracing::instrument(skip(bytes), level = "debug")]
    pub fn parse(bytes: &[u8]) -> TorrentResult<Metainfo> {
        let (top, info_span) = decode_dict_capturing_span(bytes, b"info")?;

        let info_value = top
            .get(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("info is not a dict".to_string()))?;

        let (span_start, span_end) = info_span
            .ok_or_else(|| TorrentError::InvalidFormat("info span not recorded".to_string()))?;
        let info_hash = compute_info_hash(&bytes[span_start..span_end]);

        let piece_length = required_integer(info_dict, "piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::InvalidFormat(
                "piece length must be positive".to_string(),
            ));
        }
        let piece_length = piece_length as u32;

        let pieces_bytes = required_string(info_dict, "pieces")?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::InvalidPiecesHashLength(pieces_bytes.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|c| c.try_into().expect("chunks_exact(20) yields 20 bytes"))
            .collect();

        let name_bytes = required_string(info_dict, "name")?;
        let name = String::from_utf8(name_bytes.to_vec())
            .map_err(|e| TorrentError::InvalidFormat(format!("name is not UTF-8: {e}")))?;

        let files = parse_files(info_dict, &name)?;
        if files.is_empty() {
            return Err(TorrentError::EmptyFileList);
        }
        let total_size: u64 = files.iter().map(|f| f.size).sum();

        let expected_pieces = total_size.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected_pieces {
            return Err(TorrentError::InvalidFormat(format!(
                "piece count mismatch: pieces field has {}, total_size/piece_length implies {}",
                piece_hashes.len(),
                expected_pieces
            )));
        }

        let trackers = parse_trackers(&top)?;

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            files,
            total_size,
            trackers,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the static description of piece `index`, or `None` if out
    /// of range. The last piece may be shorter than `piece_length`.
    pub fn piece_info(&self, index: usize) -> Option<PieceInfo> {
        let hash = *self.piece_hashes.get(index)?;
        let length = self.piece_byte_length(index)?;
        Some(PieceInfo {
            index: index as u32,
            length,
            hash,
        })
    }

    fn piece_byte_length(&self, index: usize) -> Option<u32> {
        if index >= self.num_pieces() {
            return None;
        }
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.total_size.saturating_sub(start);
        Some(remaining.min(self.piece_length as u64) as u32)
    }
}

fn required_integer(dict: &crate::bencode::Dict, key: &str) -> TorrentResult<i64> {
    dict.get(key.as_bytes())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

fn required_string<'a>(dict: &'a crate::bencode::Dict, key: &str) -> TorrentResult<&'a [u8]> {
    dict.get(key.as_bytes())
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

/// Rejects absolute paths and `..` components, and replaces characters
/// that are invalid on common filesystems with `_`.
fn sanitize_component(raw: &str) -> TorrentResult<String> {
    if raw.is_empty() || raw == ".." || raw == "." {
        return Err(TorrentError::UnsafePath(raw.to_string()));
    }
    let sanitized: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c => c,
        })
        .collect();
    Ok(sanitized)
}

fn parse_files(info_dict: &crate::bencode::Dict, name: &str) -> TorrentResult<Vec<FileInfo>> {
    let root: &Path = Path::new(name);
    let mut files = Vec::new();
    let mut start_byte: u64 = 0;

    match info_dict.get(b"files") {
        Some(BencodeValue::List(entries)) => {
            for entry in entries {
                let entry_dict = entry
                    .as_dict()
                    .ok_or_else(|| TorrentError::InvalidFormat("file entry not a dict".into()))?;
                let size = required_integer(entry_dict, "length")?;
                if size < 0 {
                    return Err(TorrentError::InvalidFormat("negative file length".into()));
                }
                let path_list = entry_dict
                    .get(b"path")
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| TorrentError::MissingField("path".to_string()))?;

                let mut path = root.to_path_buf();
                for component in path_list {
                    let bytes = component
                        .as_bytes()
                        .ok_or_else(|| TorrentError::InvalidFormat("path component not a string".into()))?;
                    let s = String::from_utf8(bytes.to_vec())
                        .map_err(|e| TorrentError::InvalidFormat(format!("path not UTF-8: {e}")))?;
                    path.push(sanitize_component(&s)?);
                }

                let size = size as u64;
                files.push(FileInfo {
                    path,
                    size,
                    start_byte,
                    end_byte: start_byte + size,
                });
                start_byte += size;
            }
        }
        Some(_) => return Err(TorrentError::InvalidFormat("files is not a list".into())),
        None => {
            let size = required_integer(info_dict, "length")?;
            if size < 0 {
                return Err(TorrentError::InvalidFormat("negative file length".into()));
            }
            let size = size as u64;
            files.push(FileInfo {
                path: root.to_path_buf(),
                size,
                start_byte: 0,
                end_byte: size,
            });
        }
    }

    Ok(files)
}

fn parse_trackers(top: &crate::bencode::Dict) -> TorrentResult<Vec<String>> {
    let mut trackers = Vec::new();
    let mut push_unique = |url: String, trackers: &mut Vec<String>| {
        if !trackers.contains(&url) {
            trackers.push(url);
        }
    };

    if let Some(BencodeValue::String(bytes)) = top.get(b"announce") {
        let url = String::from_utf8(bytes.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("announce not UTF-8: {e}")))?;
        push_unique(url, &mut trackers);
    }

    if let Some(BencodeValue::List(tiers)) = top.get(b"announce-list") {
        for tier in tiers {
            let tier_urls = tier
                .as_list()
                .ok_or_else(|| TorrentError::InvalidFormat("announce-list tier not a list".into()))?;
            for url_value in tier_urls {
                let bytes = url_value.as_bytes().ok_or_else(|| {
                    TorrentError::InvalidFormat("tracker URL not a string".into())
                })?;
                let url = String::from_utf8(bytes.to_vec())
                    .map_err(|e| TorrentError::InvalidFormat(format!("tracker URL not UTF-8: {e}")))?;
                push_unique(url, &mut trackers);
            }
        }
    }

    Ok(trackers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use crate::bencode::{BencodeValue, Dict};

    fn build_single_file_torrent(piece_length: i64, file_len: i64, pieces: &[u8]) -> Vec<u8> {
        let mut info = Dict::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces.to_vec()));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(file_len));

        let mut top = Dict::new();
        top.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://x/".to_vec()),
        );
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode_to_vec(&BencodeValue::Dict(top)).unwrap()
    }

    #[test]
    fn parses_single_file_torrent_and_hashes_info_dict() {
        let bytes = build_single_file_torrent(16384, 1, &[0u8; 20]);
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.total_size, 1);
        assert_eq!(metainfo.piece_length, 16384);
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.trackers, vec!["http://x/".to_string()]);
        assert_eq!(metainfo.piece_info(0).unwrap().length, 1);

        // The recorded info span must hash independently to the same
        // value a manual extraction would produce.
        let (_top, span) = decode_dict_capturing_span(&bytes, b"info").unwrap();
        let (start, end) = span.unwrap();
        let expected = compute_info_hash(&bytes[start..end]);
        assert_eq!(metainfo.info_hash, expected);
    }

    #[test]
    fn last_piece_is_shorter_when_not_evenly_divisible() {
        let hashes = [0u8; 40]; // two pieces
        let bytes = build_single_file_torrent(10, 13, &hashes);
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_info(0).unwrap().length, 10);
        assert_eq!(metainfo.piece_info(1).unwrap().length, 3);
    }

    #[test]
    fn empty_file_list_is_rejected() {
        let mut info = Dict::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"files".to_vec(), BencodeValue::List(vec![]));
        let mut top = Dict::new();
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        assert!(matches!(
            Metainfo::parse(&bytes),
            Err(TorrentError::EmptyFileList)
        ));
    }

    #[test]
    fn rejects_path_traversal_components() {
        let mut file = Dict::new();
        file.insert(b"length".to_vec(), BencodeValue::Integer(1));
        file.insert(
            b"path".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::String(b"..".to_vec()),
                BencodeValue::String(b"etc".to_vec()),
            ]),
        );
        let mut info = Dict::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"files".to_vec(), BencodeValue::List(vec![BencodeValue::Dict(file)]));
        let mut top = Dict::new();
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        assert!(matches!(
            Metainfo::parse(&bytes),
            Err(TorrentError::UnsafePath(_))
        ));
    }

    #[test]
    fn announce_list_union_deduplicates_and_preserves_order() {
        let mut info = Dict::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"name".to_vec(), BencodeValue::String(b"a".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));

        let mut top = Dict::new();
        top.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://a/".to_vec()),
        );
        top.insert(
            b"announce-list".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::List(vec![BencodeValue::String(b"http://a/".to_vec())]),
                BencodeValue::List(vec![BencodeValue::String(b"http://b/".to_vec())]),
            ]),
        );
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(
            metainfo.trackers,
            vec!["http://a/".to_string(), "http://b/".to_string()]
        );
    }
}
