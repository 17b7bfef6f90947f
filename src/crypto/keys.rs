//! Key material carried by transactions
//!
//! These are opaque 32-byte values. The ledger only compares and stores
//! them; deriving or checking them belongs to the signature layer behind
//! [`CryptoVerifier`](super::CryptoVerifier).

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{hash_with_domain, Hash};

macro_rules! key_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                Hash::from_hex(s).map(|h| $name(h.0))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

key_newtype!(
    /// Unique tag of a spent output; appears at most once in the ledger
    KeyImage
);

key_newtype!(
    /// One-time destination key of an output
    PublicKey
);

key_newtype!(
    /// Amount commitment of a confidential output
    Commitment
);

/// Commitment to a cleartext amount with an identity blinding mask.
///
/// Miner transactions of version 2 and above publish cleartext amounts but
/// are indexed alongside confidential outputs, so they get a deterministic
/// commitment derived from the amount alone.
pub fn zero_commit(amount: u64) -> Commitment {
    Commitment(hash_with_domain(b"zero_commit", &amount.to_le_bytes()).0)
}
