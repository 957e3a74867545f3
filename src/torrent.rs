use log::info;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::ApplicationError;

/// Represents a parsed single-file .torrent
#[derive(Debug, Serialize, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info:     Info,
    #[serde(skip)]
    pub info_raw_bytes: Vec<u8>,
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    pub length: Option<i64>,
    pub files:  Option<Vec<serde_bencode::value::Value>>,
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`] struct
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let data = fs::read(path.as_ref())?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data)
                .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| ApplicationError::ParserError("missing info".into()))?;

        // The info hash is computed over the re-encoded info dictionary
        let info_raw_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let torrent: Torrent = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        if torrent.info.files.is_some() || torrent.info.length.is_none() {
            return Err(ApplicationError::ParserError(
                "multi-file torrents are not supported".into(),
            ));
        }
        if torrent.info.piece_length <= 0 || torrent.info.pieces.len() % 20 != 0 {
            return Err(ApplicationError::ParserError(
                "malformed piece geometry".into(),
            ));
        }

        Ok(Torrent {
            info_raw_bytes,
            ..torrent
        })
    }

    /// Computes the SHA1 hash of the bencoded `info` dictionary
    pub fn info_hash(&self) -> [u8; 20] {
        let digest = Sha1::digest(&self.info_raw_bytes);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        arr
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn total_size(&self) -> u64 {
        self.info.length.unwrap_or(0).max(0) as u64
    }

    /// Returns the number of pieces the torrent is divided into
    pub fn pieces_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Returns the declared length of each piece (in bytes)
    ///
    /// The last piece may be shorter.
    pub fn piece_length(&self) -> u64 {
        self.info.piece_length as u64
    }

    /// Piece and block geometry used by the download.
    pub fn layout(&self, block_length: u32) -> Layout {
        Layout {
            info_hash:    self.info_hash(),
            piece_length: self.piece_length(),
            total_length: self.total_size(),
            piece_count:  self.pieces_count(),
            block_length,
        }
    }

    pub fn log_info(&self) {
        info!("Torrent Info:");
        info!("  Name: {}", self.info.name);
        info!("  Announce URL: {}", self.announce);
        info!("  Info Hash: {}", hex::encode(self.info_hash()));
        info!("  Piece Length: {} bytes", self.piece_length());
        info!("  Total Pieces: {}", self.pieces_count());
        info!("  Total Size: {} bytes", self.total_size());
    }
}

/// Piece and block geometry of a single-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub info_hash:    [u8; 20],
    pub piece_length: u64,
    pub total_length: u64,
    pub piece_count:  usize,
    pub block_length: u32,
}

impl Layout {
    /// Size of the piece in bytes; only the last piece may be shorter.
    pub fn piece_size(&self, index: usize) -> u64 {
        if index + 1 == self.piece_count {
            let rem = self.total_length.saturating_sub(self.piece_length * (self.piece_count as u64 - 1));
            rem.min(self.piece_length)
        } else {
            self.piece_length
        }
    }

    pub fn blocks_per_piece(&self, index: usize) -> usize {
        self.piece_size(index).div_ceil(self.block_length as u64) as usize
    }

    /// Length of the `block`-th block of piece `index`, truncated for the
    /// tail of the last piece.
    pub fn block_length_at(&self, index: usize, block: usize) -> u32 {
        let begin = block as u64 * self.block_length as u64;
        let remaining = self.piece_size(index).saturating_sub(begin);
        remaining.min(self.block_length as u64) as u32
    }

    /// Absolute byte offset of a block in the output file.
    pub fn file_offset(&self, index: u32, begin: u32) -> u64 {
        index as u64 * self.piece_length + begin as u64
    }
}
