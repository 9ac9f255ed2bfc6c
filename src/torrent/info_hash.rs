//! Info-hash computation.
//!
//! The info-hash is the SHA-1 of the *original* byte range the `info` dict
//! occupied in the source `.torrent` file, not of a re-encoded form — two
//! bencode encoders can disagree on integer formatting or key order only in
//! non-canonical input, and either would silently produce a different
//! swarm identifier. `torrent::metainfo::parse` locates that byte range
//! with [`crate::bencode::decoder::decode_dict_capturing_span`] and passes
//! the raw slice here.
use sha1::{Digest, Sha1};

/// Computes the SHA-1 of the raw bytes of an `info` dict, as they appeared
/// in the source torrent file.
pub fn compute_info_hash(raw_info_dict: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(raw_info_dict);
    hasher.finalize().into()
}
