use serde::Serialize;
use std::fmt;

/// How the image representation is pooled before the head
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ClassifierPooling {
    /// read out the prepended class token
    Token,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViTConfig {
    pub name: Box<str>,
    pub patch_size: usize,
    pub hidden_size: usize,
    pub mlp_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub attention_dropout_rate: f32,
    pub dropout_rate: f32,
    pub classifier: ClassifierPooling,
}

pub const VIT_CONFIG_NAMES: [&str; 6] = [
    "ViT-B_16", "ViT-B_32", "ViT-L_16", "ViT-L_32", "ViT-H_14", "testing",
];

impl ViTConfig {
    fn preset(
        name: &str,
        patch_size: usize,
        hidden_size: usize,
        mlp_dim: usize,
        num_heads: usize,
        num_layers: usize,
    ) -> Self {
        Self {
            name: name.into(),
            patch_size,
            hidden_size,
            mlp_dim,
            num_heads,
            num_layers,
            attention_dropout_rate: 0.0,
            dropout_rate: 0.1,
            classifier: ClassifierPooling::Token,
        }
    }

    pub fn vit_b16() -> Self {
        Self::preset("ViT-B_16", 16, 768, 3072, 12, 12)
    }

    pub fn vit_b32() -> Self {
        Self::preset("ViT-B_32", 32, 768, 3072, 12, 12)
    }

    pub fn vit_l16() -> Self {
        Self::preset("ViT-L_16", 16, 1024, 4096, 16, 24)
    }

    pub fn vit_l32() -> Self {
        Self::preset("ViT-L_32", 32, 1024, 4096, 16, 24)
    }

    pub fn vit_h14() -> Self {
        Self::preset("ViT-H_14", 14, 1280, 5120, 16, 32)
    }

    /// a one-dimensional model for smoke tests
    pub fn testing() -> Self {
        Self::preset("testing", 16, 1, 1, 1, 1)
    }

    /// Look up a preset by checkpoint name, e.g. `ViT-B_16`;
    /// the lookup ignores case (`vit-B_16` works too)
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name.to_lowercase().as_str() {
            "vit-b_16" => Ok(Self::vit_b16()),
            "vit-b_32" => Ok(Self::vit_b32()),
            "vit-l_16" => Ok(Self::vit_l16()),
            "vit-l_32" => Ok(Self::vit_l32()),
            "vit-h_14" => Ok(Self::vit_h14()),
            "testing" => Ok(Self::testing()),
            _ => Err(anyhow::anyhow!(
                "unknown ViT model type `{}`; expected one of {:?}",
                name,
                VIT_CONFIG_NAMES
            )),
        }
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    /// number of patches along one side of the image
    pub fn grid_size(&self, img_size: usize) -> usize {
        img_size / self.patch_size
    }

    /// number of patches plus the class token
    pub fn num_tokens(&self, img_size: usize) -> usize {
        let gs = self.grid_size(img_size);
        gs * gs + 1
    }

    pub fn validate(&self, img_size: usize) -> anyhow::Result<()> {
        if self.hidden_size % self.num_heads != 0 {
            return Err(anyhow::anyhow!(
                "hidden size {} is not a multiple of {} heads",
                self.hidden_size,
                self.num_heads
            ));
        }
        if img_size < self.patch_size {
            return Err(anyhow::anyhow!(
                "image size {} is smaller than the patch size {}",
                img_size,
                self.patch_size
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ViTConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: patches {}x{}, hidden {}, mlp {}, heads {}, layers {}, \
	     attention dropout {}, dropout {}, classifier {:?}",
            self.name,
            self.patch_size,
            self.patch_size,
            self.hidden_size,
            self.mlp_dim,
            self.num_heads,
            self.num_layers,
            self.attention_dropout_rate,
            self.dropout_rate,
            self.classifier
        )
    }
}
