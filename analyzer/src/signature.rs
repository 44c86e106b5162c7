//! Payload signatures used for dynamic protocol detection.
//!
//! A signature is a structural pattern over the first bytes of a payload: a byte string
//! expected at a fixed offset, optionally with a bit mask so that only some bits have to match.

use snafu::{ensure, ResultExt, Snafu};

/// Errors raised while building a signature.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SignatureError {
    #[snafu(display("signature pattern is empty"))]
    EmptyPattern,

    #[snafu(display("signature mask has {} bytes but the pattern has {}", mask, pattern))]
    MaskLength { pattern: usize, mask: usize },

    #[snafu(display("invalid hex in signature: {}", source))]
    InvalidHex { source: hex::FromHexError },
}

/// A structural payload pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    offset: usize,
    pattern: Vec<u8>,
    mask: Option<Vec<u8>>,
}

impl Signature {
    /// Create a signature expecting `pattern` at `offset`.
    pub fn new(offset: usize, pattern: Vec<u8>) -> Result<Self, SignatureError> {
        ensure!(!pattern.is_empty(), EmptyPatternSnafu);
        Ok(Self {
            offset,
            pattern,
            mask: None,
        })
    }

    /// Create a signature where only the bits set in `mask` are compared.
    pub fn with_mask(offset: usize, pattern: Vec<u8>, mask: Vec<u8>) -> Result<Self, SignatureError> {
        ensure!(!pattern.is_empty(), EmptyPatternSnafu);
        ensure!(
            mask.len() == pattern.len(),
            MaskLengthSnafu {
                pattern: pattern.len(),
                mask: mask.len(),
            }
        );
        Ok(Self {
            offset,
            pattern,
            mask: Some(mask),
        })
    }

    /// Build a signature from hex strings, as found in configuration files.
    ///
    /// # Arguments
    ///
    /// * `offset` - The payload offset where the pattern starts.
    /// * `pattern` - The hex-encoded pattern.
    /// * `mask` - An optional hex-encoded mask of the same length as the pattern.
    pub fn from_hex(offset: usize, pattern: &str, mask: Option<&str>) -> Result<Self, SignatureError> {
        let pattern = hex::decode(pattern).context(InvalidHexSnafu)?;
        match mask {
            Some(mask) => {
                let mask = hex::decode(mask).context(InvalidHexSnafu)?;
                Self::with_mask(offset, pattern, mask)
            }
            None => Self::new(offset, pattern),
        }
    }

    /// The number of payload bytes the signature needs to see.
    pub fn required_len(&self) -> usize {
        self.offset + self.pattern.len()
    }

    /// Checks the payload prefix against the signature.
    pub fn matches(&self, payload: &[u8]) -> bool {
        if payload.len() < self.required_len() {
            return false;
        }

        let window = &payload[self.offset..self.required_len()];
        match &self.mask {
            Some(mask) => window
                .iter()
                .zip(self.pattern.iter())
                .zip(mask.iter())
                .all(|((b, p), m)| b & m == p & m),
            None => window == self.pattern.as_slice(),
        }
    }
}
