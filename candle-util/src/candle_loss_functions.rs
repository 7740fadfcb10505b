use candle_core::{DType, Result, Tensor, D};

/// Mean cross-entropy of class logits against integer labels
///
/// * `logits_nk` - unnormalized scores (n x k)
/// * `labels_n` - class indexes (n), `u32`
///
pub fn cross_entropy_loss(logits_nk: &Tensor, labels_n: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits_nk, labels_n)
}

/// Number of rows whose argmax matches the label
pub fn count_correct(logits_nk: &Tensor, labels_n: &Tensor) -> Result<usize> {
    let predicted = logits_nk.argmax(D::Minus1)?;
    let labels_n = labels_n.to_dtype(predicted.dtype())?;
    let hits = predicted
        .eq(&labels_n)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits.round() as usize)
}
