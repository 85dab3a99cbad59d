//! Merge operators fold partial updates into a full value.

use super::types::Key;
use crate::error::{Error, Result};

/// An associative function registered with the engine to combine merge
/// operands, oldest first, on top of an optional base value.
pub trait MergeOperator: Send + Sync {
    fn name(&self) -> &str;

    fn full_merge(&self, key: &Key, base: Option<&[u8]>, operands: &[Vec<u8>]) -> Result<Vec<u8>>;
}

/// Adds decimal integers written as ASCII, e.g. `"+1"` and `"-4"`.
/// A missing base counts as zero.
pub struct DecimalAddOperator;

impl DecimalAddOperator {
    fn parse(&self, bytes: &[u8]) -> Result<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| Error::Merge {
                operator: self.name().to_string(),
                reason: format!("not a decimal integer: {:?}", String::from_utf8_lossy(bytes)),
            })
    }
}

impl MergeOperator for DecimalAddOperator {
    fn name(&self) -> &str {
        "decimal-add"
    }

    fn full_merge(&self, _key: &Key, base: Option<&[u8]>, operands: &[Vec<u8>]) -> Result<Vec<u8>> {
        let mut total = match base {
            Some(bytes) => self.parse(bytes)?,
            None => 0,
        };
        for operand in operands {
            total = total.checked_add(self.parse(operand)?).ok_or_else(|| Error::Merge {
                operator: self.name().to_string(),
                reason: "integer overflow".into(),
            })?;
        }
        Ok(total.to_string().into_bytes())
    }
}

/// Folds operands left unresolved by the memtables against the value the
/// persisted tables hold for `key`.
pub fn resolve(
    operator: Option<&dyn MergeOperator>,
    key: &Key,
    base: Option<&[u8]>,
    operands: &[Vec<u8>],
) -> Result<Vec<u8>> {
    match operator {
        Some(op) => op.full_merge(key, base, operands),
        None => Err(Error::MergeOperatorMissing),
    }
}
