//! Batch-dimension selectors

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

/// Addresses a subset of the examples in a batch.
///
/// Negative positions count from the end (`-1` is the last example). A single
/// [`Selector::Index`] still produces a batch of size one; the batch dimension
/// is never squeezed away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// One example
    Index(isize),
    /// Half-open range of examples; `end: None` runs to the end of the batch
    Range { start: usize, end: Option<usize> },
    /// Arbitrary positions, in the order given; repeats are allowed
    Indices(Vec<isize>),
    /// One flag per example, selected where `true`
    Mask(Vec<bool>),
}

impl Selector {
    /// Selects every example.
    pub fn all() -> Self {
        Selector::Range {
            start: 0,
            end: None,
        }
    }

    /// Build a selector from a 1-D tensor of positions (I64 or I32).
    pub fn from_index_tensor<R: Runtime<DType = DType>>(indices: &Tensor<R>) -> Result<Self> {
        if indices.shape().len() != 1 {
            return Err(Error::InvalidArgument {
                arg: "indices",
                reason: format!("expected a 1-D tensor, got shape {:?}", indices.shape()),
            });
        }
        let positions: Vec<isize> = match indices.dtype() {
            DType::I64 => indices
                .contiguous()
                .to_vec::<i64>()
                .into_iter()
                .map(|i| i as isize)
                .collect(),
            DType::I32 => indices
                .contiguous()
                .to_vec::<i32>()
                .into_iter()
                .map(|i| i as isize)
                .collect(),
            other => {
                return Err(Error::InvalidArgument {
                    arg: "indices",
                    reason: format!("expected an integer tensor, got {other:?}"),
                });
            }
        };
        Ok(Selector::Indices(positions))
    }

    /// Resolve to concrete row positions for a batch of `batch_size` examples.
    ///
    /// Every returned position is `< batch_size` and the result is never empty.
    pub fn resolve(&self, batch_size: usize) -> Result<Vec<usize>> {
        let rows = match self {
            Selector::Index(i) => vec![wrap(*i, batch_size)?],
            Selector::Range { start, end } => {
                let end = end.unwrap_or(batch_size);
                if *start > end || end > batch_size {
                    return Err(Error::IndexOutOfRange {
                        index: format!("{start}..{end}"),
                        batch_size,
                    });
                }
                (*start..end).collect()
            }
            Selector::Indices(positions) => positions
                .iter()
                .map(|&i| wrap(i, batch_size))
                .collect::<Result<Vec<_>>>()?,
            Selector::Mask(mask) => {
                if mask.len() != batch_size {
                    return Err(Error::IndexOutOfRange {
                        index: format!("mask of length {}", mask.len()),
                        batch_size,
                    });
                }
                mask.iter()
                    .enumerate()
                    .filter_map(|(i, &keep)| keep.then_some(i))
                    .collect()
            }
        };
        if rows.is_empty() {
            return Err(Error::IndexOutOfRange {
                index: format!("{self:?} (empty selection)"),
                batch_size,
            });
        }
        Ok(rows)
    }
}

fn wrap(i: isize, batch_size: usize) -> Result<usize> {
    let n = batch_size as isize;
    let pos = if i < 0 { i + n } else { i };
    if pos < 0 || pos >= n {
        return Err(Error::IndexOutOfRange {
            index: i.to_string(),
            batch_size,
        });
    }
    Ok(pos as usize)
}

impl From<usize> for Selector {
    fn from(i: usize) -> Self {
        Selector::Index(i as isize)
    }
}

impl From<Range<usize>> for Selector {
    fn from(r: Range<usize>) -> Self {
        Selector::Range {
            start: r.start,
            end: Some(r.end),
        }
    }
}

impl From<RangeFrom<usize>> for Selector {
    fn from(r: RangeFrom<usize>) -> Self {
        Selector::Range {
            start: r.start,
            end: None,
        }
    }
}

impl From<RangeTo<usize>> for Selector {
    fn from(r: RangeTo<usize>) -> Self {
        Selector::Range {
            start: 0,
            end: Some(r.end),
        }
    }
}

impl From<RangeFull> for Selector {
    fn from(_: RangeFull) -> Self {
        Selector::all()
    }
}

impl From<Vec<usize>> for Selector {
    fn from(v: Vec<usize>) -> Self {
        Selector::Indices(v.into_iter().map(|i| i as isize).collect())
    }
}

impl From<&[usize]> for Selector {
    fn from(v: &[usize]) -> Self {
        Selector::Indices(v.iter().map(|&i| i as isize).collect())
    }
}

impl From<Vec<bool>> for Selector {
    fn from(mask: Vec<bool>) -> Self {
        Selector::Mask(mask)
    }
}

impl From<&[bool]> for Selector {
    fn from(mask: &[bool]) -> Self {
        Selector::Mask(mask.to_vec())
    }
}
