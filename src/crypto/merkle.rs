//! Merkle root over ballot ids.
//!
//! Leaves are `sha256(0x00 ‖ id)` and inner nodes `sha256(0x01 ‖ left ‖ right)`,
//! computed over the ids in ascending order. An odd node at the end of a level is
//! promoted unchanged. The empty tree has the all-zero root.

use data_encoding::HEXLOWER;

use super::{sha256, zero_hash_hex, HASH_LEN};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Compute the hex Merkle root of the given ids, which need not be sorted.
pub fn merkle_root<S: AsRef<str>>(ids: &[S]) -> String {
    let mut sorted: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();

    let mut level: Vec<[u8; HASH_LEN]> = sorted
        .into_iter()
        .map(|id| {
            let mut bytes = Vec::with_capacity(id.len() + 1);
            bytes.push(LEAF_PREFIX);
            bytes.extend_from_slice(id.as_bytes());
            sha256(bytes)
        })
        .collect();
    if level.is_empty() {
        return zero_hash_hex();
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut bytes = Vec::with_capacity(1 + 2 * HASH_LEN);
                    bytes.push(NODE_PREFIX);
                    bytes.extend_from_slice(left);
                    bytes.extend_from_slice(right);
                    sha256(bytes)
                }
                [odd] => *odd,
                _ => unreachable!("chunks(2) yields one or two elements"),
            })
            .collect();
    }
    HEXLOWER.encode(&level[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str) -> [u8; HASH_LEN] {
        let mut bytes = vec![LEAF_PREFIX];
        bytes.extend_from_slice(id.as_bytes());
        sha256(bytes)
    }

    fn node(left: &[u8], right: &[u8]) -> [u8; HASH_LEN] {
        let mut bytes = vec![NODE_PREFIX];
        bytes.extend_from_slice(left);
        bytes.extend_from_slice(right);
        sha256(bytes)
    }

    #[test]
    fn empty_tree() {
        let ids: [&str; 0] = [];
        assert_eq!(merkle_root(&ids), zero_hash_hex());
    }

    #[test]
    fn single_leaf_is_root() {
        assert_eq!(merkle_root(&["a"]), HEXLOWER.encode(&leaf("a")));
    }

    #[test]
    fn odd_leaf_is_promoted() {
        let expected = node(&node(&leaf("a"), &leaf("b")), &leaf("c"));
        assert_eq!(merkle_root(&["a", "b", "c"]), HEXLOWER.encode(&expected));
    }

    #[test]
    fn order_of_input_is_irrelevant() {
        assert_eq!(merkle_root(&["c", "a", "b", "d"]), merkle_root(&["a", "b", "c", "d"]));
    }

    #[test]
    fn different_sets_differ() {
        assert_ne!(merkle_root(&["a", "b"]), merkle_root(&["a", "c"]));
    }
}
