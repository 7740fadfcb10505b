use candle_core::{Result, Tensor};

pub trait ClassifierModuleT {
    /// A classifier that spits out class logits
    ///
    /// # Arguments
    /// * `x` - input batch (n x ...)
    /// * `train` - whether to use dropout or not
    ///
    /// # Returns `logits_nk` (n x k)
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor>;

    fn num_classes(&self) -> usize;
}
