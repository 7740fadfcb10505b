use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::Optimizer;

/////////////////////////////////////////////
// SGD with momentum and L2 weight decay   //
/////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.03,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

/// g = grad + wd * p ; buf = momentum * buf + g ; p = p - lr * buf
#[derive(Debug)]
pub struct SgdMomentum {
    vars: Vec<(Var, Tensor)>,
    params: ParamsSgd,
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let buf = var.zeros_like()?;
                Ok((var, buf))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;

        for (var, buf) in self.vars.iter_mut() {
            if let Some(grad) = grads.get(var) {
                let grad = if weight_decay != 0.0 {
                    grad.add(&var.affine(weight_decay, 0.)?)?
                } else {
                    grad.clone()
                };
                let next_buf = if momentum != 0.0 {
                    buf.affine(momentum, 0.)?.add(&grad)?
                } else {
                    grad
                };
                var.set(&var.sub(&next_buf.affine(lr, 0.)?)?)?;
                *buf = next_buf;
            }
        }
        Ok(())
    }
}

/////////////////////////////////////////////
// Adam with the AMSGrad correction        //
/////////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: true,
        }
    }
}

#[derive(Debug)]
struct AdamVar {
    var: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    max_second_moment: Tensor,
}

/// Adam with coupled (L2) weight decay; with `amsgrad` the
/// denominator uses the running maximum of the second moment
#[derive(Debug)]
pub struct Adam {
    vars: Vec<AdamVar>,
    step_t: usize,
    params: ParamsAdam,
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = var.zeros_like()?;
                let second_moment = var.zeros_like()?;
                let max_second_moment = var.zeros_like()?;
                Ok(AdamVar {
                    var,
                    first_moment,
                    second_moment,
                    max_second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            amsgrad,
        } = self.params;

        let bias_correction1 = 1. - beta1.powi(self.step_t as i32);
        let bias_correction2 = 1. - beta2.powi(self.step_t as i32);
        let step_size = lr / bias_correction1;

        for state in self.vars.iter_mut() {
            let var = &state.var;
            if let Some(grad) = grads.get(var) {
                let grad = if weight_decay != 0.0 {
                    grad.add(&var.affine(weight_decay, 0.)?)?
                } else {
                    grad.clone()
                };

                let m = state
                    .first_moment
                    .affine(beta1, 0.)?
                    .add(&grad.affine(1. - beta1, 0.)?)?;
                let v = state
                    .second_moment
                    .affine(beta2, 0.)?
                    .add(&grad.sqr()?.affine(1. - beta2, 0.)?)?;

                let v_hat = if amsgrad {
                    let v_max = state.max_second_moment.maximum(&v)?;
                    state.max_second_moment = v_max.clone();
                    v_max
                } else {
                    v.clone()
                };

                let denom = v_hat
                    .sqrt()?
                    .affine(1. / bias_correction2.sqrt(), eps)?;
                let update = m.div(&denom)?.affine(step_size, 0.)?;
                var.set(&var.sub(&update)?)?;

                state.first_moment = m;
                state.second_moment = v;
            }
        }
        Ok(())
    }
}

/// Clip the gradients of `vars` in place so that their global L2
/// norm is at most `max_norm`; returns the norm before clipping
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            let s = grad.sqr()?.sum_all()?.to_dtype(DType::F32)?;
            sq_sum += s.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = sq_sum.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, grad.affine(clip_coef, 0.)?);
            }
        }
    }
    Ok(total_norm)
}

/// A hook between `backward` and the optimizer step, e.g. to
/// average gradients over data-parallel replicas
pub trait GradientSync {
    fn sync_grads(&mut self, grads: &mut GradStore) -> anyhow::Result<()>;
}

/// Gradients stay as they are in a single process
pub struct LocalGradients;

impl GradientSync for LocalGradients {
    fn sync_grads(&mut self, _grads: &mut GradStore) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Trainable variables of `varmap` ordered by name.
///
/// `VarMap::all_vars` follows the hash order of the map, which differs
/// between processes. Collectives that pair up parameters by position
/// need this order instead.
pub fn sorted_vars(varmap: &candle_nn::VarMap) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("variable map lock: {}", e)))?;
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
}
