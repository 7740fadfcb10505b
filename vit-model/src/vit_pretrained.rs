use crate::vit_config::ViTConfig;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

const POSEMB_KEY: &str = "Transformer/posembed_input/pos_embedding";
const POSEMB_VAR: &str = "transformer.embeddings.position_embeddings";

/// How a checkpoint array is laid out relative to the model variable
#[derive(Clone, Copy, Debug, PartialEq)]
enum Layout {
    /// same values, possibly a different shape
    Plain,
    /// dense kernel stored as (in, out); the model keeps (out, in)
    Kernel,
    /// conv kernel stored as HWIO; the model keeps OIHW
    Conv,
}

struct CheckpointEntry {
    ckpt: String,
    var: String,
    layout: Layout,
    ckpt_shape: Vec<usize>,
}

fn entry(ckpt: String, var: String, layout: Layout, ckpt_shape: Vec<usize>) -> CheckpointEntry {
    CheckpointEntry {
        ckpt,
        var,
        layout,
        ckpt_shape,
    }
}

/// Name and layout correspondence between the released ViT
/// checkpoints and `VisionTransformer` variables (position
/// embeddings excluded)
fn checkpoint_entries(
    config: &ViTConfig,
    num_classes: usize,
    include_head: bool,
) -> Vec<CheckpointEntry> {
    use Layout::*;

    let h = config.hidden_size;
    let p = config.patch_size;
    let m = config.mlp_dim;
    let heads = config.num_heads;
    let hd = config.head_dim();

    let mut ret = vec![
        entry(
            "embedding/kernel".into(),
            "transformer.embeddings.patch_embeddings.weight".into(),
            Conv,
            vec![p, p, 3, h],
        ),
        entry(
            "embedding/bias".into(),
            "transformer.embeddings.patch_embeddings.bias".into(),
            Plain,
            vec![h],
        ),
        entry(
            "cls".into(),
            "transformer.embeddings.cls_token".into(),
            Plain,
            vec![1, 1, h],
        ),
        entry(
            "Transformer/encoder_norm/scale".into(),
            "transformer.encoder.encoder_norm.weight".into(),
            Plain,
            vec![h],
        ),
        entry(
            "Transformer/encoder_norm/bias".into(),
            "transformer.encoder.encoder_norm.bias".into(),
            Plain,
            vec![h],
        ),
    ];

    for i in 0..config.num_layers {
        let src = format!("Transformer/encoderblock_{}", i);
        let dst = format!("transformer.encoder.layer.{}", i);

        for (ln, norm) in [("LayerNorm_0", "attention_norm"), ("LayerNorm_2", "ffn_norm")] {
            ret.push(entry(
                format!("{src}/{ln}/scale"),
                format!("{dst}.{norm}.weight"),
                Plain,
                vec![h],
            ));
            ret.push(entry(
                format!("{src}/{ln}/bias"),
                format!("{dst}.{norm}.bias"),
                Plain,
                vec![h],
            ));
        }

        for (dense, fc, dims) in [("Dense_0", "fc1", (h, m)), ("Dense_1", "fc2", (m, h))] {
            ret.push(entry(
                format!("{src}/MlpBlock_3/{dense}/kernel"),
                format!("{dst}.ffn.{fc}.weight"),
                Kernel,
                vec![dims.0, dims.1],
            ));
            ret.push(entry(
                format!("{src}/MlpBlock_3/{dense}/bias"),
                format!("{dst}.ffn.{fc}.bias"),
                Plain,
                vec![dims.1],
            ));
        }

        for proj in ["query", "key", "value"] {
            ret.push(entry(
                format!("{src}/MultiHeadDotProductAttention_1/{proj}/kernel"),
                format!("{dst}.attn.{proj}.weight"),
                Kernel,
                vec![h, heads, hd],
            ));
            ret.push(entry(
                format!("{src}/MultiHeadDotProductAttention_1/{proj}/bias"),
                format!("{dst}.attn.{proj}.bias"),
                Plain,
                vec![heads, hd],
            ));
        }
        ret.push(entry(
            format!("{src}/MultiHeadDotProductAttention_1/out/kernel"),
            format!("{dst}.attn.out.weight"),
            Kernel,
            vec![heads, hd, h],
        ));
        ret.push(entry(
            format!("{src}/MultiHeadDotProductAttention_1/out/bias"),
            format!("{dst}.attn.out.bias"),
            Plain,
            vec![h],
        ));
    }

    if include_head {
        ret.push(entry(
            "head/kernel".into(),
            "head.weight".into(),
            Kernel,
            vec![h, num_classes],
        ));
        ret.push(entry(
            "head/bias".into(),
            "head.bias".into(),
            Plain,
            vec![num_classes],
        ));
    }

    ret
}

impl Layout {
    fn to_model(self, src: &Tensor, var_dims: &[usize]) -> candle_core::Result<Tensor> {
        match self {
            Layout::Plain => src.reshape(var_dims),
            Layout::Kernel => {
                let (d_out, d_in) = (var_dims[0], var_dims[1]);
                src.reshape((d_in, d_out))?.t()?.contiguous()
            }
            Layout::Conv => src.permute((3, 2, 0, 1))?.contiguous(),
        }
    }

    fn to_checkpoint(self, var: &Tensor, ckpt_shape: &[usize]) -> candle_core::Result<Tensor> {
        match self {
            Layout::Plain => var.reshape(ckpt_shape),
            Layout::Kernel => var.t()?.contiguous()?.reshape(ckpt_shape),
            Layout::Conv => var.permute((2, 3, 1, 0))?.contiguous(),
        }
    }
}

fn assign(var: &Var, value: &Tensor, name: &str) -> anyhow::Result<()> {
    if value.dims() != var.dims() {
        return Err(anyhow::anyhow!(
            "shape mismatch for `{}`: checkpoint {:?} vs. model {:?}",
            name,
            value.dims(),
            var.dims()
        ));
    }
    let value = value
        .to_dtype(var.dtype())?
        .to_device(var.device())?
        .contiguous()?;
    var.set(&value)?;
    Ok(())
}

fn read_npz_map(path: &Path) -> anyhow::Result<HashMap<String, Tensor>> {
    let tensors = Tensor::read_npz(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(tensors
        .into_iter()
        .map(|(name, t)| (name.trim_end_matches(".npy").to_string(), t))
        .collect())
}

/// Load the released ViT weights (`.npz`) into the variables of a
/// `VisionTransformer` built on `varmap`
///
/// * `varmap` - variables of the model
/// * `path` - numpy archive, e.g. `ViT-B_16.npz`
/// * `config` - architecture the model was built with
/// * `zero_head` - keep the (zero) head instead of loading it
///
/// Position embeddings are resized when the checkpoint was trained
/// with a different number of patches.
pub fn load_pretrained_npz(
    varmap: &VarMap,
    path: &Path,
    config: &ViTConfig,
    zero_head: bool,
) -> anyhow::Result<()> {
    info!("Loading pretrained weights from {}", path.display());
    let tensors = read_npz_map(path)?;

    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;

    let num_classes = vars
        .get("head.bias")
        .ok_or(anyhow::anyhow!("model has no `head.bias`"))?
        .dim(0)?;

    for e in checkpoint_entries(config, num_classes, !zero_head) {
        let src = tensors.get(&e.ckpt).ok_or(anyhow::anyhow!(
            "pretrained archive {} has no `{}`",
            path.display(),
            e.ckpt
        ))?;
        let var = vars
            .get(&e.var)
            .ok_or(anyhow::anyhow!("model has no variable `{}`", e.var))?;
        let value = e
            .layout
            .to_model(src, var.dims())
            .map_err(|err| anyhow::anyhow!("`{}` -> `{}`: {}", e.ckpt, e.var, err))?;
        assign(var, &value, &e.ckpt)?;
        debug!("{} -> {}", e.ckpt, e.var);
    }

    let posemb = tensors.get(POSEMB_KEY).ok_or(anyhow::anyhow!(
        "pretrained archive {} has no `{}`",
        path.display(),
        POSEMB_KEY
    ))?;
    let pos_var = vars
        .get(POSEMB_VAR)
        .ok_or(anyhow::anyhow!("model has no variable `{}`", POSEMB_VAR))?;

    let ntok_new = pos_var.dim(1)?;
    let posemb = if posemb.dim(1)? == ntok_new {
        posemb.clone()
    } else {
        info!(
            "load_pretrained: resized variant: {:?} to {:?}",
            posemb.dims(),
            pos_var.dims()
        );
        resize_position_embedding(posemb, ntok_new)?
    };
    assign(pos_var, &posemb, POSEMB_KEY)?;

    info!("Loaded {} pretrained arrays", tensors.len());
    Ok(())
}

/// Save the model variables in the same archive layout that
/// `load_pretrained_npz` reads
pub fn save_pretrained_npz(varmap: &VarMap, path: &Path, config: &ViTConfig) -> anyhow::Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;

    let num_classes = vars
        .get("head.bias")
        .ok_or(anyhow::anyhow!("model has no `head.bias`"))?
        .dim(0)?;

    let mut arrays: Vec<(String, Tensor)> = vec![];
    for e in checkpoint_entries(config, num_classes, true) {
        let var = vars
            .get(&e.var)
            .ok_or(anyhow::anyhow!("model has no variable `{}`", e.var))?;
        let value = e.layout.to_checkpoint(var.as_tensor(), &e.ckpt_shape)?;
        arrays.push((e.ckpt, value.to_device(&Device::Cpu)?));
    }

    let pos_var = vars
        .get(POSEMB_VAR)
        .ok_or(anyhow::anyhow!("model has no variable `{}`", POSEMB_VAR))?;
    arrays.push((POSEMB_KEY.to_string(), pos_var.to_device(&Device::Cpu)?));

    Tensor::write_npz(&arrays, path)?;
    info!("Saved {} arrays to {}", arrays.len(), path.display());
    Ok(())
}

/// Resize `posemb` (1 x (1 + g*g) x h) to `ntok_new` tokens: the
/// class token is kept; the g x g grid is zoomed bilinearly
pub fn resize_position_embedding(posemb: &Tensor, ntok_new: usize) -> anyhow::Result<Tensor> {
    let (_, ntok_old, hidden) = posemb.dims3()?;
    let gs_old = square_side(ntok_old.saturating_sub(1))?;
    let gs_new = square_side(ntok_new.saturating_sub(1))?;
    info!("load_pretrained: grid-size from {} to {}", gs_old, gs_new);

    let device = posemb.device();
    let posemb = posemb.to_device(&Device::Cpu)?;

    let tok = posemb.narrow(1, 0, 1)?;
    let grid: Vec<f32> = posemb
        .narrow(1, 1, ntok_old - 1)?
        .flatten_all()?
        .to_dtype(candle_core::DType::F32)?
        .to_vec1()?;

    let zoomed = zoom_bilinear(&grid, gs_old, gs_new, hidden);
    let grid = Tensor::from_vec(zoomed, (1, gs_new * gs_new, hidden), &Device::Cpu)?
        .to_dtype(tok.dtype())?;

    Ok(Tensor::cat(&[&tok, &grid], 1)?.to_device(device)?)
}

fn square_side(n: usize) -> anyhow::Result<usize> {
    let side = (n as f64).sqrt().round() as usize;
    if side * side != n || side == 0 {
        return Err(anyhow::anyhow!(
            "{} position embeddings do not form a square grid",
            n
        ));
    }
    Ok(side)
}

/// Order-1 zoom of a (gs_old x gs_old x dim) grid to (gs_new x gs_new
/// x dim); output `o` samples input `o * (gs_old - 1) / (gs_new - 1)`,
/// so the corners are preserved
pub fn zoom_bilinear(grid: &[f32], gs_old: usize, gs_new: usize, dim: usize) -> Vec<f32> {
    let coord = |o: usize| -> (usize, usize, f32) {
        let c = if gs_new > 1 {
            o as f32 * (gs_old - 1) as f32 / (gs_new - 1) as f32
        } else {
            0.0
        };
        let lb = (c.floor() as usize).min(gs_old - 1);
        let ub = (lb + 1).min(gs_old - 1);
        (lb, ub, c - lb as f32)
    };

    let at = |r: usize, c: usize, k: usize| grid[(r * gs_old + c) * dim + k];

    let mut ret = Vec::with_capacity(gs_new * gs_new * dim);
    for i in 0..gs_new {
        let (r0, r1, wr) = coord(i);
        for j in 0..gs_new {
            let (c0, c1, wc) = coord(j);
            for k in 0..dim {
                let top = at(r0, c0, k) * (1. - wc) + at(r0, c1, k) * wc;
                let bottom = at(r1, c0, k) * (1. - wc) + at(r1, c1, k) * wc;
                ret.push(top * (1. - wr) + bottom * wr);
            }
        }
    }
    ret
}

/// Total number of trainable parameters
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// Same as `count_parameters` in millions
pub fn count_parameters_millions(varmap: &VarMap) -> f64 {
    count_parameters(varmap) as f64 / 1e6
}
