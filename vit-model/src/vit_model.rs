use crate::vit_config::ViTConfig;
use crate::vit_layers::{Embeddings, Encoder};

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};
use candle_util::candle_model_traits::ClassifierModuleT;
use std::fmt;

pub struct Transformer {
    embeddings: Embeddings,
    encoder: Encoder,
}

impl Transformer {
    pub fn new(config: &ViTConfig, img_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embeddings: Embeddings::new(config, img_size, vb.pp("embeddings"))?,
            encoder: Encoder::new(config, vb.pp("encoder"))?,
        })
    }

    pub fn forward_t(
        &self,
        x_nchw: &Tensor,
        train: bool,
        keep_weights: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let tokens = self.embeddings.forward_t(x_nchw, train)?;
        self.encoder.forward_t(&tokens, train, keep_weights)
    }
}

/// Vision Transformer with a linear head on the class token
pub struct VisionTransformer {
    config: ViTConfig,
    img_size: usize,
    num_classes: usize,
    zero_head: bool,
    transformer: Transformer,
    head: Linear,
}

impl VisionTransformer {
    /// * `config` - architecture
    /// * `img_size` - side of the (square) input images
    /// * `num_classes` - output dimension of the head
    /// * `zero_head` - start the head at zero (for fine-tuning)
    /// * `vb` - variable builder; names follow `transformer.*` and `head.*`
    pub fn new(
        config: &ViTConfig,
        img_size: usize,
        num_classes: usize,
        zero_head: bool,
        vb: VarBuilder,
    ) -> anyhow::Result<Self> {
        config.validate(img_size)?;

        let transformer = Transformer::new(config, img_size, vb.pp("transformer"))?;

        let head = if zero_head {
            let vb = vb.pp("head");
            let w = vb.get_with_hints(
                (num_classes, config.hidden_size),
                "weight",
                candle_nn::init::ZERO,
            )?;
            let b = vb.get_with_hints(num_classes, "bias", candle_nn::init::ZERO)?;
            Linear::new(w, Some(b))
        } else {
            candle_nn::linear(config.hidden_size, num_classes, vb.pp("head"))?
        };

        Ok(Self {
            config: config.clone(),
            img_size,
            num_classes,
            zero_head,
            transformer,
            head,
        })
    }

    /// logits and the attention weights of every layer
    pub fn forward_with_attention(
        &self,
        x_nchw: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let (x, weights) = self.transformer.forward_t(x_nchw, train, true)?;
        Ok((self.classify(&x)?, weights))
    }

    fn classify(&self, tokens: &Tensor) -> Result<Tensor> {
        let cls = tokens.narrow(1, 0, 1)?.squeeze(1)?;
        self.head.forward(&cls)
    }

    pub fn config(&self) -> &ViTConfig {
        &self.config
    }

    pub fn img_size(&self) -> usize {
        self.img_size
    }
}

impl ClassifierModuleT for VisionTransformer {
    fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        let (x, _) = self.transformer.forward_t(x_nchw, train, false)?;
        self.classify(&x)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl fmt::Display for VisionTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        let h = c.hidden_size;
        let p = c.patch_size;
        writeln!(f, "VisionTransformer(")?;
        writeln!(f, "  (transformer): Transformer(")?;
        writeln!(f, "    (embeddings): Embeddings(")?;
        writeln!(
            f,
            "      (patch_embeddings): Conv2d(3, {h}, kernel_size=({p}, {p}), stride=({p}, {p}))"
        )?;
        writeln!(f, "      (cls_token): Parameter(1, 1, {h})")?;
        writeln!(
            f,
            "      (position_embeddings): Parameter(1, {}, {h})",
            c.num_tokens(self.img_size)
        )?;
        writeln!(f, "      (dropout): Dropout(p={})", c.dropout_rate)?;
        writeln!(f, "    )")?;
        writeln!(f, "    (encoder): Encoder(")?;
        writeln!(f, "      (layer): {} x Block(", c.num_layers)?;
        writeln!(f, "        (attention_norm): LayerNorm(({h},), eps=1e-06)")?;
        writeln!(f, "        (ffn_norm): LayerNorm(({h},), eps=1e-06)")?;
        writeln!(f, "        (ffn): Mlp(")?;
        writeln!(f, "          (fc1): Linear(in_features={h}, out_features={})", c.mlp_dim)?;
        writeln!(f, "          (fc2): Linear(in_features={}, out_features={h})", c.mlp_dim)?;
        writeln!(f, "          (dropout): Dropout(p={})", c.dropout_rate)?;
        writeln!(f, "        )")?;
        writeln!(f, "        (attn): Attention(")?;
        writeln!(f, "          heads={}, head_dim={}", c.num_heads, c.head_dim())?;
        for name in ["query", "key", "value", "out"] {
            writeln!(f, "          ({name}): Linear(in_features={h}, out_features={h})")?;
        }
        writeln!(f, "          (attn_dropout): Dropout(p={})", c.attention_dropout_rate)?;
        writeln!(f, "        )")?;
        writeln!(f, "      )")?;
        writeln!(f, "      (encoder_norm): LayerNorm(({h},), eps=1e-06)")?;
        writeln!(f, "    )")?;
        writeln!(f, "  )")?;
        writeln!(
            f,
            "  (head): Linear(in_features={h}, out_features={}, zero_init={})",
            self.num_classes, self.zero_head
        )?;
        write!(f, ")")
    }
}
