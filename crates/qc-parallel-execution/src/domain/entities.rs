//! # Core Domain Entities
//!
//! Inputs and outputs of the interpreter contract: the message a job
//! carries, the block it runs in, and the receipt it produces.

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use super::errors::InterpreterError;
use super::value_objects::{Address, TxIndex};

// =============================================================================
// MESSAGE
// =============================================================================

/// State-mutating operation carried by a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Account paying gas and advancing its nonce.
    pub sender: Address,
    /// Target account (`None` for creation).
    pub to: Option<Address>,
    /// Value transferred.
    pub value: U256,
    /// Sender nonce.
    pub nonce: u64,
    /// Gas limit.
    pub gas_limit: u64,
    /// Gas price.
    pub gas_price: U256,
    /// Call data.
    pub data: Vec<u8>,
}

impl Message {
    /// Creates a call from `sender` to `to`.
    #[must_use]
    pub fn call(sender: Address, to: Address) -> Self {
        Self {
            sender,
            to: Some(to),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_gas(mut self, gas_limit: u64, gas_price: U256) -> Self {
        self.gas_limit = gas_limit;
        self.gas_price = gas_price;
        self
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            sender: Address::zero(),
            to: None,
            value: U256::zero(),
            nonce: 0,
            gas_limit: 1_000_000,
            gas_price: U256::zero(),
            data: Vec::new(),
        }
    }
}

// =============================================================================
// BLOCK CONTEXT
// =============================================================================

/// Block-level information shared by every job of a generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    /// Block number.
    pub number: u64,
    /// Block timestamp (unix seconds).
    pub timestamp: u64,
    /// Beneficiary credited with fees.
    pub coinbase: Address,
    /// Block gas limit.
    pub gas_limit: u64,
    /// Chain ID.
    pub chain_id: u64,
}

impl BlockContext {
    #[must_use]
    pub fn with_coinbase(mut self, coinbase: Address) -> Self {
        self.coinbase = coinbase;
        self
    }
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 0,
            timestamp: 0,
            coinbase: Address::zero(),
            gas_limit: 30_000_000,
            chain_id: 1,
        }
    }
}

// =============================================================================
// RECEIPT
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Failed,
}

/// Receipt issued by the interpreter once a job ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_index: TxIndex,
    pub status: ReceiptStatus,
    pub gas_used: u64,
}

impl Receipt {
    pub fn success(tx_index: TxIndex, gas_used: u64) -> Self {
        Self {
            tx_index,
            status: ReceiptStatus::Success,
            gas_used,
        }
    }

    pub fn failed(tx_index: TxIndex, gas_used: u64) -> Self {
        Self {
            tx_index,
            status: ReceiptStatus::Failed,
            gas_used,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// Outcome of one interpreter run.
///
/// A missing receipt means the message was rejected before execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Execution {
    pub receipt: Option<Receipt>,
    pub output: Vec<u8>,
    pub error: Option<InterpreterError>,
}

impl Execution {
    pub fn success(receipt: Receipt, output: Vec<u8>) -> Self {
        Self {
            receipt: Some(receipt),
            output,
            error: None,
        }
    }

    pub fn failure(receipt: Receipt, error: InterpreterError) -> Self {
        Self {
            receipt: Some(receipt),
            output: Vec::new(),
            error: Some(error),
        }
    }

    pub fn rejected(error: InterpreterError) -> Self {
        Self {
            receipt: None,
            output: Vec::new(),
            error: Some(error),
        }
    }

    pub fn gas_used(&self) -> u64 {
        self.receipt.as_ref().map_or(0, |r| r.gas_used)
    }
}
