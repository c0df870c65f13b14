//! Sequence losses and accuracy metrics

use crate::error::{Error, Result};
use crate::transition::{ScoreKind, SeqClient};
use numr::autograd::{Var, var_gather, var_mul, var_mul_scalar, var_reshape, var_sum};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Token-level cross-entropy over a decoded sequence, ignoring padding.
///
/// - `scores`: `[B, T, V]` step scores of kind `kind`
/// - `gold`: `[B, L]` I64 gold ids; truncated or right-padded to `T`
///
/// Returns the mean negative log-likelihood over non-pad gold positions, or
/// zero when every position is padding.
pub fn sequence_ce_loss<R, C>(
    client: &C,
    scores: &Var<R>,
    kind: ScoreKind,
    gold: &Tensor<R>,
    pad_id: i64,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: SeqClient<R>,
    R::Client: SeqClient<R>,
{
    let shape = scores.shape().to_vec();
    if shape.len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "scores",
            reason: format!("expected [B, T, V], got {shape:?}"),
        });
    }
    let (b, t, v) = (shape[0], shape[1], shape[2]);
    if gold.shape().len() != 2 || gold.shape()[0] != b {
        return Err(Error::InvalidArgument {
            arg: "gold",
            reason: format!("expected [{b}, L], got {:?}", gold.shape()),
        });
    }

    let targets = align_gold(&gold.contiguous().to_vec::<i64>(), gold.shape()[1], t, pad_id);
    let weights: Vec<f32> = targets
        .iter()
        .map(|&id| if id == pad_id { 0.0 } else { 1.0 })
        .collect();
    let count = weights.iter().filter(|&&w| w > 0.0).count();

    let n = b * t;
    let device = gold.device();
    let targets = Tensor::<R>::from_slice(&targets, &[n, 1], device);
    let weights = Var::new(Tensor::<R>::from_slice(&weights, &[n, 1], device), false);

    let log_probs = kind.to_log_probs(client, scores)?;
    let flat = var_reshape(&log_probs, &[n, v]).map_err(Error::Numr)?;
    let picked = var_gather(&flat, 1, &targets, client).map_err(Error::Numr)?;
    let kept = var_mul(&picked, &weights, client).map_err(Error::Numr)?;
    let total = var_sum(&kept, &[0, 1], false, client).map_err(Error::Numr)?;
    var_mul_scalar(&total, -1.0 / count.max(1) as f64, client).map_err(Error::Numr)
}

/// Row-major `[B, width]` ids cut or padded to `[B, t]`.
fn align_gold(ids: &[i64], width: usize, t: usize, pad_id: i64) -> Vec<i64> {
    let rows = if width == 0 { 0 } else { ids.len() / width };
    let mut out = Vec::with_capacity(rows * t);
    for row in ids.chunks(width.max(1)).take(rows) {
        for step in 0..t {
            out.push(row.get(step).copied().unwrap_or(pad_id));
        }
    }
    out
}

/// Accuracy of decoded sequences against gold.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SeqAccuracies {
    /// Fraction of gold tokens predicted at the right position
    pub element: f64,
    /// Fraction of examples predicted exactly
    pub sequence: f64,
}

/// Compare predictions with gold, both as id rows.
///
/// Each row is cut after its first `end_id` and stripped of `pad_id`, so
/// trailing output after the end token never counts.
pub fn sequence_accuracies(predicted: &[Vec<i64>], gold: &[Vec<i64>], pad_id: i64, end_id: i64) -> Result<SeqAccuracies> {
    if predicted.len() != gold.len() {
        return Err(Error::LengthMismatch {
            inputs: predicted.len(),
            outputs: gold.len(),
        });
    }
    if gold.is_empty() {
        return Ok(SeqAccuracies::default());
    }

    let mut correct_tokens = 0usize;
    let mut gold_tokens = 0usize;
    let mut exact = 0usize;
    for (p, g) in predicted.iter().zip(gold) {
        let p = trim(p, pad_id, end_id);
        let g = trim(g, pad_id, end_id);
        gold_tokens += g.len();
        correct_tokens += g.iter().zip(&p).filter(|(a, b)| a == b).count();
        if p == g {
            exact += 1;
        }
    }

    Ok(SeqAccuracies {
        element: if gold_tokens == 0 {
            1.0
        } else {
            correct_tokens as f64 / gold_tokens as f64
        },
        sequence: exact as f64 / gold.len() as f64,
    })
}

fn trim(ids: &[i64], pad_id: i64, end_id: i64) -> Vec<i64> {
    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        if id == pad_id {
            continue;
        }
        out.push(id);
        if id == end_id {
            break;
        }
    }
    out
}
