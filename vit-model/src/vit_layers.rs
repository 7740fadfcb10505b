use crate::vit_config::ViTConfig;

use candle_core::{Module, ModuleT, Result, Tensor, D};
use candle_nn::{ops, Conv2d, Dropout, LayerNorm, Linear, VarBuilder};

const LAYER_NORM_EPS: f64 = 1e-6;

//////////////////////////////////////////////
// patch + class token + position embedding //
//////////////////////////////////////////////

pub struct Embeddings {
    patch_embeddings: Conv2d,
    cls_token: Tensor,
    position_embeddings: Tensor,
    dropout: Dropout,
    hidden_size: usize,
}

impl Embeddings {
    pub fn new(config: &ViTConfig, img_size: usize, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let conv_config = candle_nn::Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embeddings = candle_nn::conv2d(
            3,
            hidden,
            config.patch_size,
            conv_config,
            vb.pp("patch_embeddings"),
        )?;
        let cls_token = vb.get_with_hints((1, 1, hidden), "cls_token", candle_nn::init::ZERO)?;
        let position_embeddings = vb.get_with_hints(
            (1, config.num_tokens(img_size), hidden),
            "position_embeddings",
            candle_nn::init::ZERO,
        )?;

        Ok(Self {
            patch_embeddings,
            cls_token,
            position_embeddings,
            dropout: Dropout::new(config.dropout_rate),
            hidden_size: hidden,
        })
    }

    /// images (n x 3 x s x s) -> tokens (n x (1 + g*g) x h)
    pub fn forward_t(&self, x_nchw: &Tensor, train: bool) -> Result<Tensor> {
        let n = x_nchw.dim(0)?;
        let x = self
            .patch_embeddings
            .forward(x_nchw)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        let cls = self
            .cls_token
            .expand((n, 1, self.hidden_size))?
            .contiguous()?;
        let x = Tensor::cat(&[&cls, &x], 1)?;
        let x = x.broadcast_add(&self.position_embeddings)?;
        self.dropout.forward_t(&x, train)
    }
}

///////////////////////////////
// multi-head self-attention //
///////////////////////////////

pub struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    attn_dropout: Dropout,
    proj_dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            query: candle_nn::linear(hidden, hidden, vb.pp("query"))?,
            key: candle_nn::linear(hidden, hidden, vb.pp("key"))?,
            value: candle_nn::linear(hidden, hidden, vb.pp("value"))?,
            out: candle_nn::linear(hidden, hidden, vb.pp("out"))?,
            attn_dropout: Dropout::new(config.attention_dropout_rate),
            proj_dropout: Dropout::new(config.attention_dropout_rate),
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    // (n, t, h) -> (n, heads, t, head_dim)
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (n, t, _) = x.dims3()?;
        x.reshape((n, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns the attended tokens and the attention weights
    /// (n x heads x t x t)
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (n, t, h) = x.dims3()?;

        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(x)?)?;
        let v = self.split_heads(&self.value.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(scale, 0.)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let weights = probs.clone();

        let ctx = self
            .attn_dropout
            .forward_t(&probs, train)?
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, t, h))?;

        let out = self.proj_dropout.forward_t(&self.out.forward(&ctx)?, train)?;
        Ok((out, weights))
    }
}

//////////////////////////
// fc1 -> gelu -> fc2   //
//////////////////////////

pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl Mlp {
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: candle_nn::linear(config.hidden_size, config.mlp_dim, vb.pp("fc1"))?,
            fc2: candle_nn::linear(config.mlp_dim, config.hidden_size, vb.pp("fc2"))?,
            dropout: Dropout::new(config.dropout_rate),
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.fc1.forward(x)?.gelu_erf()?;
        let x = self.dropout.forward_t(&x, train)?;
        let x = self.fc2.forward(&x)?;
        self.dropout.forward_t(&x, train)
    }
}

//////////////////////////////////
// pre-norm transformer block   //
//////////////////////////////////

pub struct Block {
    attention_norm: LayerNorm,
    ffn_norm: LayerNorm,
    ffn: Mlp,
    attn: Attention,
}

impl Block {
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            attention_norm: candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("attention_norm"))?,
            ffn_norm: candle_nn::layer_norm(hidden, LAYER_NORM_EPS, vb.pp("ffn_norm"))?,
            ffn: Mlp::new(config, vb.pp("ffn"))?,
            attn: Attention::new(config, vb.pp("attn"))?,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (h, weights) = self
            .attn
            .forward_t(&self.attention_norm.forward(x)?, train)?;
        let x = (x + h)?;
        let h = self.ffn.forward_t(&self.ffn_norm.forward(&x)?, train)?;
        Ok(((x + h)?, weights))
    }
}

pub struct Encoder {
    layers: Vec<Block>,
    encoder_norm: LayerNorm,
}

impl Encoder {
    pub fn new(config: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|i| Block::new(config, vb.pp(format!("layer.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        let encoder_norm =
            candle_nn::layer_norm(config.hidden_size, LAYER_NORM_EPS, vb.pp("encoder_norm"))?;
        Ok(Self {
            layers,
            encoder_norm,
        })
    }

    /// * `keep_weights` - collect the attention weights of each layer
    pub fn forward_t(
        &self,
        x: &Tensor,
        train: bool,
        keep_weights: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let mut x = x.clone();
        let mut attn_weights = vec![];
        for layer in self.layers.iter() {
            let (h, weights) = layer.forward_t(&x, train)?;
            x = h;
            if keep_weights {
                attn_weights.push(weights);
            }
        }
        Ok((self.encoder_norm.forward(&x)?, attn_weights))
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
