//! Transaction structure
//!
//! Versioned transactions spending outputs by key image. Version 1 carries
//! cleartext amounts and ring signatures; version 2 and above hide amounts
//! behind commitments proven by the RCT data.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{hash_bytes, Commitment, CryptoVerifier, Hash, KeyImage, PublicKey};

/// Transaction decoding errors
#[derive(Debug, Error)]
pub enum TxError {
    #[error("Malformed transaction blob: {0}")]
    Malformed(String),
    #[error("RCT output count {rct} does not match {outputs} outputs")]
    RctMismatch { rct: usize, outputs: usize },
}

/// A transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxInput {
    /// Coinbase input of a miner transaction
    Gen { height: u64 },
    /// Spend of one ring member, identified by its key image
    ToKey {
        amount: u64,
        /// Relative global output indices of the ring members
        key_offsets: Vec<u64>,
        key_image: KeyImage,
    },
    /// Script spends are recognised on the wire but never accepted
    ToScript { prev: Hash, prevout: u64, sigset: Vec<u8> },
    ToScriptHash { prev: Hash, prevout: u64, script: Vec<u8>, sigset: Vec<u8> },
}

impl TxInput {
    pub fn key_image(&self) -> Option<&KeyImage> {
        match self {
            TxInput::ToKey { key_image, .. } => Some(key_image),
            _ => None,
        }
    }
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Amount in atomic units; zero for confidential outputs
    pub amount: u64,
    /// One-time destination key
    pub key: PublicKey,
}

/// Per-output public data of a confidential transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPk {
    pub dest: PublicKey,
    pub mask: Commitment,
}

/// Confidential-transaction data. The proof body is opaque to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RctSignatures {
    pub rct_type: u8,
    pub txn_fee: u64,
    pub out_pk: Vec<OutPk>,
    pub proof: Vec<u8>,
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    /// Height or timestamp before which the outputs cannot be spent
    pub unlock_time: u64,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub extra: Vec<u8>,
    /// Ring signatures of version-1 transactions, one set per input
    pub signatures: Vec<Vec<u8>>,
    pub rct: Option<RctSignatures>,
}

impl Transaction {
    /// Create a miner transaction paying `outputs` at `height`
    pub fn miner(version: u32, height: u64, outputs: Vec<TxOutput>, unlock_window: u64) -> Self {
        Self {
            version,
            unlock_time: height + unlock_window,
            inputs: vec![TxInput::Gen { height }],
            outputs,
            extra: Vec::new(),
            signatures: Vec::new(),
            rct: None,
        }
    }

    /// A miner transaction has exactly one `Gen` input
    pub fn is_miner_tx(&self) -> bool {
        matches!(self.inputs.as_slice(), [TxInput::Gen { .. }])
    }

    /// Encode to the storage/wire blob
    pub fn to_blob(&self) -> Vec<u8> {
        // serializing plain data into a Vec cannot fail
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode a blob, checking structural consistency
    pub fn from_blob(blob: &[u8]) -> Result<Self, TxError> {
        let tx: Transaction =
            bincode::deserialize(blob).map_err(|e| TxError::Malformed(e.to_string()))?;
        if let Some(rct) = &tx.rct {
            if rct.out_pk.len() != tx.outputs.len() {
                return Err(TxError::RctMismatch {
                    rct: rct.out_pk.len(),
                    outputs: tx.outputs.len(),
                });
            }
        }
        Ok(tx)
    }

    /// Transaction id: hash of the full blob
    pub fn hash(&self) -> Hash {
        hash_bytes(&self.to_blob())
    }

    /// Hash of everything except signatures and proofs
    pub fn prefix_hash(&self) -> Hash {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.unlock_time.to_le_bytes());
        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            // inputs carry no signatures, so their encoding is already a prefix
            bytes.extend_from_slice(&bincode::serialize(input).unwrap_or_default());
        }
        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            bytes.extend_from_slice(&output.amount.to_le_bytes());
            bytes.extend_from_slice(output.key.as_bytes());
        }
        bytes.extend_from_slice(&self.extra);
        hash_bytes(&bytes)
    }

    /// Key images spent by this transaction, in input order
    pub fn key_images(&self) -> impl Iterator<Item = &KeyImage> {
        self.inputs.iter().filter_map(TxInput::key_image)
    }

    /// Commitment recorded for output `index`, if the output is confidential
    pub fn output_commitment(&self, index: usize) -> Option<Commitment> {
        self.rct
            .as_ref()
            .and_then(|rct| rct.out_pk.get(index))
            .map(|pk| pk.mask)
    }

    /// Sum of cleartext output amounts, `None` if it does not fit in a u64
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |total, o| total.checked_add(o.amount))
    }

    /// Whether any input is a coinbase input
    pub fn has_gen_input(&self) -> bool {
        self.inputs.iter().any(|input| matches!(input, TxInput::Gen { .. }))
    }

    /// Ask the cryptographic backend whether the signatures hold
    pub fn verify_signatures(&self, verifier: &dyn CryptoVerifier) -> bool {
        if self.is_miner_tx() {
            return true;
        }
        let prefix = self.prefix_hash();
        if self.version >= 2 {
            verifier.verify_rct_proof(&prefix, self)
        } else {
            verifier.verify_ring_signature(&prefix, self)
        }
    }
}
