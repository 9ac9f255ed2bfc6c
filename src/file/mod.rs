//! On-disk storage for a torrent's files.
//!
//! A [`FileLayer`] owns one open file handle per [`FileInfo`][crate::torrent::FileInfo]
//! entry and translates piece-relative `(index, begin, length)` addresses into
//! reads and writes against the right file(s) at the right offset, since a
//! piece can straddle a file boundary in a multi-file torrent. It is meant to
//! be owned by a single task (the scheduler), so its methods take `&mut self`
//! rather than synchronizing internally.
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// A `FileLayer` shared between the scheduler (verification reads, on
/// startup and on piece completion) and every peer session's receive path
/// (writes) and serve path (reads), serialized through a `tokio::Mutex`
/// since those callers are themselves async tasks.
pub type SharedFileLayer = Arc<tokio::sync::Mutex<FileLayer>>;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("piece index {0} out of range")]
    PieceIndexOutOfRange(u32),

    #[error("read/write request spans past the end of the torrent")]
    OutOfBounds,
}

pub type FileResult<T> = std::result::Result<T, FileError>;

struct OpenFile {
    handle: File,
    size: u64,
    start_byte: u64,
    end_byte: u64,
}

/// Owns the on-disk files backing a torrent and serves piece-addressed
/// reads and writes against them.
pub struct FileLayer {
    files: Vec<OpenFile>,
    piece_length: u32,
}

impl FileLayer {
    /// Opens (creating and truncating to declared size as needed) every
    /// file in `metainfo`, rooted at `base_dir`.
    #[tracing::instrument(skip(metainfo), fields(name = %metainfo.name))]
    pub fn open(metainfo: &Metainfo, base_dir: &Path) -> FileResult<Self> {
        let mut files = Vec::with_capacity(metainfo.files.len());
        for file_info in &metainfo.files {
            let path = base_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| FileError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|source| FileError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            if handle
                .metadata()
                .map_err(|source| FileError::Io {
                    path: path.display().to_string(),
                    source,
                })?
                .len()
                != file_info.size
            {
                handle.set_len(file_info.size).map_err(|source| FileError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
            }
            files.push(OpenFile {
                handle,
                size: file_info.size,
                start_byte: file_info.start_byte,
                end_byte: file_info.end_byte,
            });
        }
        Ok(FileLayer {
            files,
            piece_length: metainfo.piece_length,
        })
    }

    /// Finds the `(file index, offset within that file)` that a torrent-wide
    /// byte offset falls in, via binary search over `start_byte`.
    fn locate(&self, byte_in_torrent: u64) -> Option<(usize, u64)> {
        let index = match self
            .files
            .binary_search_by(|f| f.start_byte.cmp(&byte_in_torrent))
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let file = &self.files[index];
        if byte_in_torrent >= file.end_byte {
            return None;
        }
        Some((index, byte_in_torrent - file.start_byte))
    }

    /// Writes `data` at piece-relative address `(index, begin)`, splitting
    /// across file boundaries as needed.
    pub fn write(&mut self, index: u32, begin: u32, data: &[u8]) -> FileResult<()> {
        let torrent_offset = index as u64 * self.piece_length as u64 + begin as u64;
        let (mut file_index, mut offset) =
            self.locate(torrent_offset).ok_or(FileError::OutOfBounds)?;

        let mut remaining = data;
        while !remaining.is_empty() {
            if file_index >= self.files.len() {
                return Err(FileError::OutOfBounds);
            }
            let file = &mut self.files[file_index];
            let chunk_len = remaining.len().min((file.size - offset) as usize);
            let (chunk, rest) = remaining.split_at(chunk_len);

            file.handle
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.handle.write_all(chunk))
                .map_err(|source| FileError::Io {
                    path: format!("file #{file_index}"),
                    source,
                })?;

            remaining = rest;
            file_index += 1;
            offset = 0;
        }
        Ok(())
    }

    /// Reads `length` bytes starting at piece-relative address `(index, begin)`.
    pub fn read(&mut self, index: u32, begin: u32, length: u32) -> FileResult<Vec<u8>> {
        let torrent_offset = index as u64 * self.piece_length as u64 + begin as u64;
        let (mut file_index, mut offset) =
            self.locate(torrent_offset).ok_or(FileError::OutOfBounds)?;

        let mut result = Vec::with_capacity(length as usize);
        let mut remaining = length as usize;
        while remaining > 0 {
            if file_index >= self.files.len() {
                return Err(FileError::OutOfBounds);
            }
            let file = &mut self.files[file_index];
            let chunk_len = remaining.min((file.size - offset) as usize);
            let mut buf = vec![0u8; chunk_len];

            file.handle
                .seek(SeekFrom::Start(offset))
                .and_then(|_| file.handle.read_exact(&mut buf))
                .map_err(|source| FileError::Io {
                    path: format!("file #{file_index}"),
                    source,
                })?;

            result.extend_from_slice(&buf);
            remaining -= chunk_len;
            file_index += 1;
            offset = 0;
        }
        Ok(result)
    }

    /// Reads and hashes every declared piece, returning the set of piece
    /// indices whose on-disk content already matches its expected hash.
    /// Run once at startup so a resumed download doesn't re-fetch data it
    /// already has.
    #[tracing::instrument(skip(self, metainfo))]
    pub fn verify_all(&mut self, metainfo: &Metainfo) -> FileResult<Vec<bool>> {
        let mut verified = Vec::with_capacity(metainfo.num_pieces());
        for index in 0..metainfo.num_pieces() {
            let piece = metainfo
                .piece_info(index)
                .expect("index within num_pieces()");
            let data = match self.read(piece.index, 0, piece.length) {
                Ok(data) => data,
                Err(_) => {
                    verified.push(false);
                    continue;
                }
            };
            let mut hasher = Sha1::new();
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            verified.push(digest == piece.hash);
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::FileInfo;
    use std::path::PathBuf;

    fn metainfo_two_files(piece_length: u32) -> Metainfo {
        Metainfo {
            info_hash: [0u8; 20],
            name: "t".to_string(),
            piece_length,
            piece_hashes: vec![],
            files: vec![
                FileInfo {
                    path: PathBuf::from("a.bin"),
                    size: 5,
                    start_byte: 0,
                    end_byte: 5,
                },
                FileInfo {
                    path: PathBuf::from("b.bin"),
                    size: 5,
                    start_byte: 5,
                    end_byte: 10,
                },
            ],
            total_size: 10,
            trackers: vec![],
        }
    }

    #[test]
    fn write_and_read_spanning_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = metainfo_two_files(10);
        let mut layer = FileLayer::open(&metainfo, dir.path()).unwrap();

        let data: Vec<u8> = (0..10).collect();
        layer.write(0, 0, &data).unwrap();

        let read_back = layer.read(0, 0, 10).unwrap();
        assert_eq!(read_back, data);

        // A read confined to the second file only.
        let tail = layer.read(0, 7, 3).unwrap();
        assert_eq!(tail, &data[7..10]);
    }

    #[test]
    fn verify_all_detects_correct_and_incorrect_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let mut metainfo = metainfo_two_files(10);
        let data: Vec<u8> = (0..10).collect();
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let hash: [u8; 20] = hasher.finalize().into();
        metainfo.piece_hashes = vec![hash];

        let mut layer = FileLayer::open(&metainfo, dir.path()).unwrap();
        layer.write(0, 0, &data).unwrap();
        assert_eq!(layer.verify_all(&metainfo).unwrap(), vec![true]);

        layer.write(0, 0, &[0xffu8; 10]).unwrap();
        assert_eq!(layer.verify_all(&metainfo).unwrap(), vec![false]);
    }
}
