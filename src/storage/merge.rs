//! Merge operators
//!
//! A merge record stores an operand instead of a value. Readers fold the
//! operands, oldest first, onto the base value with a [`MergeOperator`].

use crate::batch::{BatchError, BatchResult};

/// Combines a base value with pending merge operands
pub trait MergeOperator: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Fold `operands` (oldest first) onto `existing_value`
    fn full_merge(
        &self,
        key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> BatchResult<Vec<u8>>;
}

/// Concatenates operands onto the value, separated by a delimiter byte
#[derive(Debug, Clone, Copy)]
pub struct StringAppendOperator {
    delimiter: u8,
}

impl StringAppendOperator {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Default for StringAppendOperator {
    fn default() -> Self {
        Self::new(b',')
    }
}

impl MergeOperator for StringAppendOperator {
    fn name(&self) -> &str {
        "StringAppendOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> BatchResult<Vec<u8>> {
        let mut result = existing_value.map(<[u8]>::to_vec).unwrap_or_default();
        for (i, operand) in operands.iter().enumerate() {
            if existing_value.is_some() || i > 0 {
                result.push(self.delimiter);
            }
            result.extend_from_slice(operand);
        }
        Ok(result)
    }
}

/// Treats values and operands as little-endian u64 counters and adds them
#[derive(Debug, Clone, Copy, Default)]
pub struct UInt64AddOperator;

impl UInt64AddOperator {
    fn decode(bytes: &[u8]) -> BatchResult<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            BatchError::MergeFailed(format!("expected 8-byte counter, got {} bytes", bytes.len()))
        })?;
        Ok(u64::from_le_bytes(raw))
    }
}

impl MergeOperator for UInt64AddOperator {
    fn name(&self) -> &str {
        "UInt64AddOperator"
    }

    fn full_merge(
        &self,
        _key: &[u8],
        existing_value: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> BatchResult<Vec<u8>> {
        let mut total = existing_value.map(Self::decode).transpose()?.unwrap_or(0);
        for operand in operands {
            total = total.wrapping_add(Self::decode(operand)?);
        }
        Ok(total.to_le_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_append() {
        let op = StringAppendOperator::default();
        assert_eq!(op.full_merge(b"k", Some(b"a"), &[b"b", b"c"]).unwrap(), b"a,b,c");
        assert_eq!(op.full_merge(b"k", None, &[b"b", b"c"]).unwrap(), b"b,c");
        assert_eq!(op.full_merge(b"k", None, &[]).unwrap(), b"");
    }

    #[test]
    fn test_uint64_add() {
        let op = UInt64AddOperator;
        let one = 1u64.to_le_bytes();
        let ten = 10u64.to_le_bytes();
        let merged = op.full_merge(b"k", Some(&ten), &[&one, &one]).unwrap();
        assert_eq!(merged, 12u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_uint64_add_rejects_malformed_operand() {
        let op = UInt64AddOperator;
        let err = op.full_merge(b"k", None, &[b"+1"]).unwrap_err();
        assert!(matches!(err, BatchError::MergeFailed(_)));
    }
}
