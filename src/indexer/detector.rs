//! Deposit Detection
//!
//! Inspects a decoded transaction's outputs for payments to monitored
//! deposit addresses and extracts the destination-ledger recipient from the
//! marker (OP_RETURN) output, if present.

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::{Address, Network, Transaction};
use tracing::{debug, warn};

use crate::config::DepositAddressRegistry;
use crate::types::{BtcNet, Deposit};

/// Detects deposits to monitored addresses
///
/// Constructed once at startup; holds the injected address registry and the
/// network's address-decoding rules.
#[derive(Clone)]
pub struct DepositDetector {
    registry: DepositAddressRegistry,
    fallback_recipient: String,
    network: Network,
}

impl DepositDetector {
    pub fn new(
        registry: DepositAddressRegistry,
        fallback_recipient: String,
        network: BtcNet,
    ) -> Self {
        Self {
            registry,
            fallback_recipient,
            network: network.bitcoin_network(),
        }
    }

    /// All deposits carried by a transaction.
    ///
    /// A transaction may yield zero, one or several deposits (multiple
    /// qualifying outputs); they all share the single recipient resolved
    /// from the marker output or the configured fallback.
    pub fn find_deposits(&self, tx: &Transaction) -> Vec<Deposit> {
        let recipient = self.extract_recipient(tx);

        let mut deposits = Vec::new();
        for (i, out) in tx.output.iter().enumerate() {
            let Ok(btc_address) = Address::from_script(&out.script_pubkey, self.network) else {
                // expected for coinbase outputs and other non-standard scripts
                debug!(vout = i, "output script does not resolve to an address");
                continue;
            };
            if let Some(entry) = self.registry.get(&btc_address.to_string()) {
                debug!(
                    tx_id = %tx.compute_txid(),
                    vout = i,
                    "found matching deposit output"
                );
                deposits.push(Deposit {
                    vout: i as u32,
                    amount_sats: out.value.to_sat(),
                    recipient: recipient.clone(),
                    package_id: entry.package_id.clone(),
                    ledger_network: entry.ledger_network.clone(),
                });
            }
        }
        deposits
    }

    /// Resolve the destination-ledger recipient for a transaction.
    ///
    /// A valid transaction carries at most one marker output; when several
    /// are present the last one wins, and the anomaly is logged so it can
    /// be alerted on. Without any marker the configured fallback address is
    /// credited, so funds are never un-attributable.
    fn extract_recipient(&self, tx: &Transaction) -> String {
        let mut recipient = None;
        for out in &tx.output {
            if let Some(parsed) = parse_recipient_from_marker(out.script_pubkey.as_bytes()) {
                if recipient.is_some() {
                    warn!(
                        tx_id = %tx.compute_txid(),
                        "multiple marker outputs in one transaction, last one wins"
                    );
                }
                recipient = Some(parsed);
            }
        }
        recipient.unwrap_or_else(|| self.fallback_recipient.clone())
    }
}

/// Parse a destination-ledger recipient out of a marker script.
///
/// Layout: `OP_RETURN <push> <flag> <payload>`, the payload starting at
/// byte offset 2. Flag `0x00` marks a simple transfer whose payload is the
/// recipient address. Other flag values are reserved for future transfer
/// formats; until those are specified the recipient cannot be determined
/// and the caller falls back.
fn parse_recipient_from_marker(script: &[u8]) -> Option<String> {
    if script.len() < 2 || script[0] != OP_RETURN.to_u8() {
        return None;
    }
    let payload = &script[2..];
    match payload.first() {
        Some(0x00) => Some(format!("0x{}", hex::encode(&payload[1..]))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::test_utils::{
        deposit_address, marker_script, p2wpkh_script, test_registry, tx_with_outputs,
    };

    const NET: BtcNet = BtcNet::Regtest;

    fn detector() -> DepositDetector {
        DepositDetector::new(test_registry(NET), "0xfallback".to_string(), NET)
    }

    #[test]
    fn test_marker_recipient_applies_to_all_deposit_outputs() {
        let tx = tx_with_outputs(vec![
            (0, marker_script(0x00, [0xab; 32])),
            (70_000, p2wpkh_script(1)),
            (30_000, p2wpkh_script(1)),
        ]);
        let deposits = detector().find_deposits(&tx);

        assert_eq!(deposits.len(), 2);
        let expected = format!("0x{}", "ab".repeat(32));
        assert_eq!(deposits[0].vout, 1);
        assert_eq!(deposits[0].amount_sats, 70_000);
        assert_eq!(deposits[0].recipient, expected);
        assert_eq!(deposits[1].vout, 2);
        assert_eq!(deposits[1].recipient, expected);
    }

    #[test]
    fn test_missing_marker_falls_back() {
        let tx = tx_with_outputs(vec![(50_000, p2wpkh_script(1))]);
        let deposits = detector().find_deposits(&tx);

        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].recipient, "0xfallback");
    }

    #[test]
    fn test_unsupported_flag_falls_back() {
        let tx = tx_with_outputs(vec![
            (0, marker_script(0x01, [0xab; 32])),
            (50_000, p2wpkh_script(1)),
        ]);
        let deposits = detector().find_deposits(&tx);

        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].recipient, "0xfallback");
    }

    #[test]
    fn test_multiple_markers_last_wins() {
        let tx = tx_with_outputs(vec![
            (0, marker_script(0x00, [0x11; 32])),
            (0, marker_script(0x00, [0x22; 32])),
            (50_000, p2wpkh_script(1)),
        ]);
        let deposits = detector().find_deposits(&tx);

        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].recipient, format!("0x{}", "22".repeat(32)));
    }

    #[test]
    fn test_unmonitored_outputs_yield_nothing() {
        // pays an address outside the registry
        let tx = tx_with_outputs(vec![(50_000, p2wpkh_script(9))]);
        assert!(detector().find_deposits(&tx).is_empty());
    }

    #[test]
    fn test_deposit_carries_package_routing() {
        let tx = tx_with_outputs(vec![(50_000, p2wpkh_script(2))]);
        let deposits = detector().find_deposits(&tx);

        assert_eq!(deposits.len(), 1);
        assert_eq!(deposits[0].package_id, "0xpkg-b");
        assert_eq!(deposits[0].ledger_network, "testnet");
    }

    #[test]
    fn test_inactive_address_still_matches() {
        // seed 3 is registered but inactive; detection still records it
        let tx = tx_with_outputs(vec![(50_000, p2wpkh_script(3))]);
        let deposits = detector().find_deposits(&tx);
        assert_eq!(deposits.len(), 1);
    }

    #[test]
    fn test_marker_parsing_edge_cases() {
        // too short
        assert!(parse_recipient_from_marker(&[0x6a]).is_none());
        // wrong opcode
        assert!(parse_recipient_from_marker(&[0x51, 0x01, 0x00]).is_none());
        // empty payload after the push byte
        assert!(parse_recipient_from_marker(&[0x6a, 0x00]).is_none());
        // minimal valid marker: flag only, empty address
        assert_eq!(
            parse_recipient_from_marker(&[0x6a, 0x01, 0x00]).as_deref(),
            Some("0x")
        );
    }

    #[test]
    fn test_registry_address_matches_script() {
        // the helper address and script must agree for the tests above to
        // mean anything
        let addr = deposit_address(1, NET);
        let derived = Address::from_script(&p2wpkh_script(1), NET.bitcoin_network()).unwrap();
        assert_eq!(addr, derived.to_string());
    }
}
