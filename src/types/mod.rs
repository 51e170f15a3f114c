//! Shared data model for the indexer

pub mod block;
pub mod deposit;

pub use block::{BlockInfo, BlockQueueMessage, BlockStatus, BtcNet};
pub use deposit::{
    confirmations, now_ms, BroadcastedDeposit, ConfirmingTx, Deposit, DepositInsertion,
    DepositRow, DepositStatusResponse, FinalizedTx, MintStatus, SenderDeposit, TxUpdate,
};
