//! Shared builders for indexer tests

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::opcodes::OP_TRUE;
use bitcoin::script::Builder;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, WPubkeyHash, Witness,
};

use crate::config::{DepositAddressEntry, DepositAddressRegistry};
use crate::types::BtcNet;

/// Deterministic P2WPKH script for a one-byte seed
pub fn p2wpkh_script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([seed; 20]))
}

/// Address string for [`p2wpkh_script`] under the given network
pub fn deposit_address(seed: u8, network: BtcNet) -> String {
    Address::from_script(&p2wpkh_script(seed), network.bitcoin_network())
        .expect("p2wpkh script is addressable")
        .to_string()
}

/// Marker output script: OP_RETURN, push, flag byte, 32-byte address
pub fn marker_script(flag: u8, addr: [u8; 32]) -> ScriptBuf {
    let mut payload = [0u8; 33];
    payload[0] = flag;
    payload[1..].copy_from_slice(&addr);
    Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(payload)
        .into_script()
}

/// A spend with one dummy input and the given `(value, script)` outputs
pub fn tx_with_outputs(outputs: Vec<(u64, ScriptBuf)>) -> Transaction {
    tx_spending(Txid::from_byte_array([0x77; 32]), outputs)
}

/// Like [`tx_with_outputs`] with a chosen previous txid, so tests can vary
/// txids and wire up sender-enrichment lookups
pub fn tx_spending(prev_txid: Txid, outputs: Vec<(u64, ScriptBuf)>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: prev_txid,
                vout: 0,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs
            .into_iter()
            .map(|(value, script_pubkey)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            })
            .collect(),
    }
}

/// Coinbase transaction whose output script resolves to no address
pub fn coinbase_tx(height_tag: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_int(height_tag as i64).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50_000_000),
            script_pubkey: Builder::new().push_opcode(OP_TRUE).into_script(),
        }],
    }
}

/// Assemble a block whose header commits to the real merkle root
pub fn block_with(txdata: Vec<Transaction>) -> Block {
    let mut block = Block {
        header: Header {
            version: BlockVersion::ONE,
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time: 1_700_000_000,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        },
        txdata,
    };
    block.header.merkle_root = block
        .compute_merkle_root()
        .expect("test blocks are non-empty");
    block
}

/// Registry with three monitored addresses:
/// seed 1 → package a (active), seed 2 → package b (active),
/// seed 3 → package c (inactive)
pub fn test_registry(network: BtcNet) -> DepositAddressRegistry {
    DepositAddressRegistry::new(vec![
        DepositAddressEntry {
            btc_address: deposit_address(1, network),
            package_id: "0xpkg-a".to_string(),
            ledger_network: "testnet".to_string(),
            active: true,
        },
        DepositAddressEntry {
            btc_address: deposit_address(2, network),
            package_id: "0xpkg-b".to_string(),
            ledger_network: "testnet".to_string(),
            active: true,
        },
        DepositAddressEntry {
            btc_address: deposit_address(3, network),
            package_id: "0xpkg-c".to_string(),
            ledger_network: "testnet".to_string(),
            active: false,
        },
    ])
    .expect("non-empty registry")
}
