//! Bitcoin transaction Merkle tree
//!
//! Builds the per-block transaction tree and produces inclusion proofs for
//! the destination ledger's on-chain verifier. Every node carries two
//! values: the single-round hash over its preimage and the double-round
//! (Bitcoin txid-style) hash. Parents are linked through double-round
//! hashes, but proof paths expose the single-round hashes, because the
//! verifier applies the second hash round itself.

use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, Witness};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Merkle engine errors
#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("cannot construct a merkle tree from an empty transaction list")]
    EmptyInput,
    #[error("target transaction not found in the tree")]
    NotFound,
}

/// One tree node: `double = sha256(single)`
#[derive(Debug, Clone, PartialEq, Eq)]
struct MerkleNode {
    /// First hash round over the node's preimage
    single: [u8; 32],
    /// Second hash round; equals the txid for leaves
    double: [u8; 32],
}

/// Merkle tree over a block's transactions
///
/// Level 0 holds one node per transaction; each level pairs adjacent nodes
/// left to right, with the last node of an odd-length level paired with
/// itself (Bitcoin consensus semantics). The final single-node level's
/// double-round hash is the root committed in the block header.
pub struct MerkleTree {
    levels: Vec<Vec<MerkleNode>>,
    root: [u8; 32],
}

impl MerkleTree {
    /// Build the tree over a non-empty transaction list
    pub fn build(transactions: &[Transaction]) -> Result<Self, MerkleError> {
        if transactions.is_empty() {
            return Err(MerkleError::EmptyInput);
        }

        let mut current: Vec<MerkleNode> = transactions.iter().map(leaf_node).collect();
        let mut levels = Vec::new();

        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // odd level: the trailing node is paired with itself
                let right = pair.get(1).unwrap_or(left);
                let single = sha256_pair(&left.double, &right.double);
                next.push(MerkleNode {
                    double: sha256(&single),
                    single,
                });
            }
            levels.push(current);
            current = next;
        }

        let root = current[0].double;
        levels.push(current);
        Ok(Self { levels, root })
    }

    /// Root of the tree (double-round hash of the top node).
    ///
    /// `big_endian` reverses the bytes: block headers display the root in
    /// reversed byte order relative to the internal order used here and in
    /// proof construction.
    pub fn root(&self, big_endian: bool) -> [u8; 32] {
        if big_endian {
            let mut reversed = self.root;
            reversed.reverse();
            reversed
        } else {
            self.root
        }
    }

    /// Inclusion proof for `target_tx`, bottom-up.
    ///
    /// Each element is the sibling node's single-round hash. A single-leaf
    /// tree yields an empty proof. Fails with [`MerkleError::NotFound`] when
    /// the transaction's txid is not among the leaves.
    pub fn proof(&self, target_tx: &Transaction) -> Result<Vec<[u8; 32]>, MerkleError> {
        let target_hash = target_tx.compute_txid().to_byte_array();
        let mut index = self.levels[0]
            .iter()
            .position(|node| node.double == target_hash)
            .ok_or(MerkleError::NotFound)?;

        let mut proof = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let is_right = index % 2 == 1;
            let is_last = index == level.len() - 1;
            let odd_level = level.len() % 2 == 1;

            let sibling = if is_last && odd_level {
                index // duplicated: the node is its own sibling
            } else if is_right {
                index - 1
            } else {
                index + 1
            };

            proof.push(level[sibling].single);
            index /= 2;
        }
        Ok(proof)
    }

    /// Index of a transaction within level 0, if present
    pub fn position(&self, target_tx: &Transaction) -> Option<usize> {
        let target_hash = target_tx.compute_txid().to_byte_array();
        self.levels[0].iter().position(|n| n.double == target_hash)
    }
}

/// Fold a proof path back to a root, the way the on-chain verifier does.
///
/// `leaf_double` is the target transaction's txid bytes (internal order),
/// `leaf_index` its position in the block. Returns the reconstructed root
/// in internal byte order.
pub fn fold_proof(leaf_double: [u8; 32], leaf_index: usize, proof: &[[u8; 32]]) -> [u8; 32] {
    let mut current = leaf_double;
    let mut index = leaf_index;
    for sibling_single in proof {
        let sibling = sha256(sibling_single);
        let single = if index % 2 == 1 {
            sha256_pair(&sibling, &current)
        } else {
            sha256_pair(&current, &sibling)
        };
        current = sha256(&single);
        index /= 2;
    }
    current
}

fn leaf_node(tx: &Transaction) -> MerkleNode {
    // txids commit to the legacy (witness-stripped) serialization
    let mut stripped = tx.clone();
    for input in &mut stripped.input {
        input.witness = Witness::default();
    }
    let single = sha256(&serialize(&stripped));
    MerkleNode {
        double: sha256(&single),
        single,
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Single SHA256 over two concatenated 32-byte values
fn sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut combined = [0u8; 64];
    combined[0..32].copy_from_slice(left);
    combined[32..64].copy_from_slice(right);
    sha256(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::{Header, Version as BlockVersion};
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, TxIn, TxMerkleNode,
        TxOut,
    };

    fn dummy_tx(value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn dummy_txs(n: u64) -> Vec<Transaction> {
        (0..n).map(|i| dummy_tx(1_000 + i)).collect()
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(matches!(MerkleTree::build(&[]), Err(MerkleError::EmptyInput)));
    }

    #[test]
    fn test_single_leaf_root_is_txid() {
        let txs = dummy_txs(1);
        let tree = MerkleTree::build(&txs).unwrap();
        assert_eq!(tree.root(false), txs[0].compute_txid().to_byte_array());
        // and the proof is empty: there are no levels to traverse
        assert!(tree.proof(&txs[0]).unwrap().is_empty());
    }

    #[test]
    fn test_proof_lengths() {
        for n in 2..=9u64 {
            let txs = dummy_txs(n);
            let tree = MerkleTree::build(&txs).unwrap();
            let expected = (n as f64).log2().ceil() as usize;
            for tx in &txs {
                assert_eq!(tree.proof(tx).unwrap().len(), expected, "n = {}", n);
            }
        }
    }

    #[test]
    fn test_odd_level_duplicates_last_node() {
        // 3-leaf tree: the last leaf is paired with itself, so its proof
        // contains its own single-round hash at level 0
        let txs = dummy_txs(3);
        let tree = MerkleTree::build(&txs).unwrap();
        let proof = tree.proof(&txs[2]).unwrap();

        let own_single = {
            let mut stripped = txs[2].clone();
            for input in &mut stripped.input {
                input.witness = Witness::default();
            }
            sha256(&serialize(&stripped))
        };
        assert_eq!(proof[0], own_single);
    }

    #[test]
    fn test_fold_proof_reproduces_root() {
        for n in 1..=9u64 {
            let txs = dummy_txs(n);
            let tree = MerkleTree::build(&txs).unwrap();
            for (i, tx) in txs.iter().enumerate() {
                let proof = tree.proof(tx).unwrap();
                let folded = fold_proof(tx.compute_txid().to_byte_array(), i, &proof);
                assert_eq!(folded, tree.root(false), "n = {}, leaf = {}", n, i);
            }
        }
    }

    #[test]
    fn test_root_matches_consensus_computation() {
        for n in [1u64, 2, 3, 5, 8] {
            let txs = dummy_txs(n);
            let tree = MerkleTree::build(&txs).unwrap();
            let block = Block {
                header: Header {
                    version: BlockVersion::ONE,
                    prev_blockhash: BlockHash::all_zeros(),
                    merkle_root: TxMerkleNode::all_zeros(),
                    time: 0,
                    bits: CompactTarget::from_consensus(0x1d00ffff),
                    nonce: 0,
                },
                txdata: txs,
            };
            let consensus_root = block.compute_merkle_root().unwrap();
            assert_eq!(tree.root(false), consensus_root.to_byte_array());
        }
    }

    #[test]
    fn test_unknown_target_rejected() {
        let txs = dummy_txs(4);
        let tree = MerkleTree::build(&txs).unwrap();
        let stranger = dummy_tx(99_999);
        assert!(matches!(tree.proof(&stranger), Err(MerkleError::NotFound)));
        assert!(tree.position(&stranger).is_none());
    }

    #[test]
    fn test_big_endian_root_is_reversed() {
        let txs = dummy_txs(2);
        let tree = MerkleTree::build(&txs).unwrap();
        let mut le = tree.root(false);
        le.reverse();
        assert_eq!(le, tree.root(true));
    }
}
