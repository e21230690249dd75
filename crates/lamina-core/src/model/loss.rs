//! Causal language-modeling loss.
//!
//! Logits at position `t` predict the label at `t + 1`. The loss is the mean
//! cross-entropy over every shifted position whose label is not the ignore
//! index. When every position is ignored the mean is undefined and the loss
//! is NaN.

use crate::error::{LaminaError, Result};
use candle_core::{DType, Tensor, D};

/// Compute the shifted next-token cross-entropy.
///
/// # Arguments
///
/// * `logits` - Scores [batch, seq_len, vocab]
/// * `labels` - Target ids [batch, seq_len], integer dtype
/// * `ignore_index` - Label value excluded from the mean
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor, ignore_index: i64) -> Result<Tensor> {
    let (batch, seq_len, vocab_size) = logits.dims3()?;
    if labels.dims() != [batch, seq_len] {
        return Err(LaminaError::ShapeMismatch(format!(
            "labels {:?} do not match logits {:?}",
            labels.dims(),
            logits.dims()
        )));
    }

    let device = logits.device();
    if seq_len < 2 {
        return Ok(Tensor::new(f32::NAN, device)?);
    }
    let shifted = seq_len - 1;

    // logits[..., :-1, :] against labels[..., 1:]
    let shift_logits = logits
        .narrow(1, 0, shifted)?
        .reshape((batch * shifted, vocab_size))?
        .to_dtype(DType::F32)?;
    let shift_labels: Vec<i64> = labels
        .narrow(1, 1, shifted)?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1()?;

    let mut rows = Vec::with_capacity(shift_labels.len());
    let mut targets = Vec::with_capacity(shift_labels.len());
    for (row, &label) in shift_labels.iter().enumerate() {
        if label == ignore_index {
            continue;
        }
        if label < 0 || label as usize >= vocab_size {
            return Err(LaminaError::LabelOutOfRange { label, vocab_size });
        }
        rows.push(row as u32);
        targets.push(label as u32);
    }

    if rows.is_empty() {
        return Ok(Tensor::new(f32::NAN, device)?);
    }
    let count = rows.len();

    let rows = Tensor::from_vec(rows, count, device)?;
    let targets = Tensor::from_vec(targets, (count, 1), device)?;

    let log_probs = candle_nn::ops::log_softmax(&shift_logits, D::Minus1)?;
    let picked = log_probs.index_select(&rows, 0)?.gather(&targets, 1)?;

    Ok((picked.sum_all()?.neg()? / count as f64)?)
}

/// Reject shifted labels outside the vocabulary.
///
/// Runs the same range check as [`causal_lm_loss`] without needing logits,
/// so a forward pass can fail before touching any state.
pub(crate) fn check_label_range(labels: &Tensor, vocab_size: usize, ignore_index: i64) -> Result<()> {
    let (_, seq_len) = labels.dims2()?;
    if seq_len < 2 {
        return Ok(());
    }

    let shifted: Vec<i64> = labels
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1()?;
    match shifted
        .into_iter()
        .find(|&label| label != ignore_index && (label < 0 || label as usize >= vocab_size))
    {
        Some(label) => Err(LaminaError::LabelOutOfRange { label, vocab_size }),
        None => Ok(()),
    }
}
