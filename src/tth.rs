//! Tiger-Tree (Merkle) hashing of shared files.
//!
//! A file is split into 1024-byte leaves; each leaf is Tiger-hashed with a
//! `0x00` prefix, interior nodes combine two child digests with a `0x01`
//! prefix, and an unpaired tail digest is promoted unchanged. The surviving
//! root digest, base32-encoded without padding, is the 39-character content
//! identifier used throughout the protocol.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use tiger::{Digest, Tiger};

use crate::error::Result;

/// The fixed leaf block size of the tree.
pub const LEAF_LEN: usize = 1024;

/// The length of a base32-encoded root.
pub const ROOT_LEN: usize = 39;

/// A raw Tiger digest. The RustCrypto implementation serializes the three
/// 64-bit state words little-endian, which is exactly the byte order NMDC
/// clients exchange.
type TigerDigest = [u8; 24];

fn leaf_hash(block: &[u8]) -> TigerDigest {
    let mut hasher = Tiger::new();
    hasher.update([0x00]);
    hasher.update(block);
    hasher.finalize().into()
}

fn node_hash(left: &TigerDigest, right: &TigerDigest) -> TigerDigest {
    let mut hasher = Tiger::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Reduces the leaf level pairwise until a single root digest survives and
/// encodes it.
fn root_of_leaves(mut level: Vec<TigerDigest>) -> String {
    if level.is_empty() {
        // an empty file consists of exactly one empty leaf
        level.push(leaf_hash(&[]));
    }
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(node_hash(&pair[0], &pair[1]));
            } else {
                // an unpaired tail digest is promoted unchanged
                next.push(pair[0]);
            }
        }
        level = next;
    }
    let root = base32::encode(base32::Alphabet::RFC4648 { padding: false }, &level[0]);
    debug_assert_eq!(root.len(), ROOT_LEN);
    root
}

/// Computes the Tiger-Tree root of an in-memory byte string.
pub fn data_root(data: &[u8]) -> String {
    root_of_leaves(data.chunks(LEAF_LEN).map(leaf_hash).collect())
}

/// Computes the Tiger-Tree root of a file, streaming it in leaf-sized blocks.
pub fn file_root(path: impl AsRef<Path>) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut leaves = Vec::new();
    let mut block = [0u8; LEAF_LEN];
    loop {
        let mut filled = 0;
        while filled < LEAF_LEN {
            let n = reader.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        leaves.push(leaf_hash(&block[..filled]));
        if filled < LEAF_LEN {
            break;
        }
    }
    Ok(root_of_leaves(leaves))
}

/// Returns whether a string is a plausible base32 Tiger-Tree root.
pub fn is_root(candidate: &str) -> bool {
    candidate.len() == ROOT_LEN
        && candidate
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    /// The well-known NMDC root of a zero-byte file.
    const EMPTY_ROOT: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";

    // Pins the digest byte order of the tiger crate to the NESSIE
    // little-endian-words representation NMDC uses.
    #[test]
    fn test_tiger_digest_order() {
        let digest = Tiger::digest(b"");
        assert_eq!(
            hex::encode(digest),
            "3293ac630c13f0245f92bbb1766e16167a4e58492dff819c"
        );
    }

    #[test]
    fn test_empty_root() {
        assert_eq!(data_root(&[]), EMPTY_ROOT);
        assert_eq!(data_root(&[]).len(), ROOT_LEN);
    }

    #[test]
    fn test_single_leaf_root() {
        let data = vec![0xabu8; 100];
        let expected = base32::encode(
            base32::Alphabet::RFC4648 { padding: false },
            &leaf_hash(&data),
        );
        assert_eq!(data_root(&data), expected);
    }

    #[test]
    fn test_two_leaf_root() {
        // 1025 bytes span exactly two leaves
        let data = vec![0x42u8; LEAF_LEN + 1];
        let expected = base32::encode(
            base32::Alphabet::RFC4648 { padding: false },
            &node_hash(&leaf_hash(&data[..LEAF_LEN]), &leaf_hash(&data[LEAF_LEN..])),
        );
        assert_eq!(data_root(&data), expected);
    }

    #[test]
    fn test_odd_tail_promotion() {
        // three leaves: the third is promoted and only combined at the top
        let data = vec![0x1fu8; 2 * LEAF_LEN + 10];
        let l0 = leaf_hash(&data[..LEAF_LEN]);
        let l1 = leaf_hash(&data[LEAF_LEN..2 * LEAF_LEN]);
        let l2 = leaf_hash(&data[2 * LEAF_LEN..]);
        let expected = base32::encode(
            base32::Alphabet::RFC4648 { padding: false },
            &node_hash(&node_hash(&l0, &l1), &l2),
        );
        assert_eq!(data_root(&data), expected);
    }

    #[test]
    fn test_file_root_matches_data_root() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        assert_eq!(file_root(file.path()).unwrap(), data_root(&data));
    }

    #[test]
    fn test_file_root_of_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(file_root(file.path()).unwrap(), EMPTY_ROOT);
    }

    #[test]
    fn test_is_root() {
        assert!(is_root(EMPTY_ROOT));
        assert!(!is_root("LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHH"));
        assert!(!is_root("lwpnacqdbzryxw3vhjvcj64qbznghohhhzwclnq"));
    }
}
