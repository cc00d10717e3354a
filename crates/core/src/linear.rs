//! Linear projections that can carry a low-rank adapter (LoRA).
//!
//! [`Projection`] is what attention blocks hold. It starts out
//! [`Projection::Plain`]; injection swaps it for [`Projection::LowRank`],
//! which keeps the original layer frozen and adds
//! `scale · (x · Aᵀ) · Bᵀ` with `scale = α / r`. Merging folds `scale · B·A`
//! back into the original weight and swaps the plain layer back in.

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// `A` starts as small Gaussian noise.
const LORA_A_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.01,
};

/// `B` starts at zero so a fresh adapter leaves the layer's output unchanged.
const LORA_B_INIT: Init = Init::Const(0.);

/// Matmul that accepts `(b, m, k)` / `(b1, b2, m, k)` inputs by folding the
/// leading dims into one. `w_t` is `(k, n)`.
pub fn matmul_reshape(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let out_dim = w_t.dim(1)?;
    match dims {
        [_, _] => x.matmul(w_t),
        [b, m, k] => {
            let x_2d = x.reshape((*b * *m, *k))?;
            let y = x_2d.matmul(w_t)?;
            y.reshape((*b, *m, out_dim))
        }
        _ => {
            let last = dims[dims.len() - 1];
            let prod: usize = dims[..dims.len() - 1].iter().product();
            let x_2d = x.reshape((prod, last))?;
            let y = x_2d.matmul(w_t)?;
            let mut out_shape: Vec<usize> = dims[..dims.len() - 1].to_vec();
            out_shape.push(out_dim);
            y.reshape(out_shape.as_slice())
        }
    }
}

// ── LoraLinear ──────────────────────────────────────────────────────────────

/// Frozen linear layer plus a trainable rank-`r` correction.
///
/// Parameters live next to the wrapped layer's: `<prefix>.lora_a` is
/// `(r, in)`, `<prefix>.lora_b` is `(out, r)`.
#[derive(Clone, Debug)]
pub struct LoraLinear {
    base: Linear,
    lora_a: Tensor,
    lora_b: Tensor,
    scale: f64,
}

impl LoraLinear {
    /// Wrap `base`. `vb` must be scoped to the projection's own prefix; if the
    /// adapter variables already exist there (e.g. a deep copy) they are reused.
    pub fn new(base: Linear, rank: usize, alpha: f64, vb: VarBuilder) -> Result<Self> {
        if rank == 0 {
            return Err(Error::Msg("adapter rank must be positive".into()));
        }
        let (out_dim, in_dim) = base.weight().dims2()?;
        let lora_a = vb.get_with_hints((rank, in_dim), "lora_a", LORA_A_INIT)?;
        let lora_b = vb.get_with_hints((out_dim, rank), "lora_b", LORA_B_INIT)?;
        Ok(Self {
            base,
            lora_a,
            lora_b,
            scale: alpha / rank as f64,
        })
    }

    pub fn rank(&self) -> usize {
        self.lora_a.dims()[0]
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    /// `scale · B · A`, shaped like the base weight `(out, in)`.
    pub fn delta_weight(&self) -> Result<Tensor> {
        self.lora_b.matmul(&self.lora_a)?.affine(self.scale, 0.0)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let base = self.base.forward(x)?;
        let down = matmul_reshape(x, &self.lora_a.t()?)?;
        let up = matmul_reshape(&down, &self.lora_b.t()?)?;
        base + up.affine(self.scale, 0.0)?
    }
}

impl Module for LoraLinear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.forward(x)
    }
}

// ── Projection (plain / adapted dispatch) ───────────────────────────────────

/// A linear-like layer: either a bare [`Linear`] or one wrapped by a
/// [`LoraLinear`]. Callers only use [`Projection::forward`].
#[derive(Clone, Debug)]
pub enum Projection {
    Plain(Linear),
    LowRank(LoraLinear),
}

impl Projection {
    /// Plain `in_dim → out_dim` projection with bias.
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::Plain(candle_nn::linear(in_dim, out_dim, vb)?))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Plain(l) => l.forward(x),
            Self::LowRank(l) => l.forward(x),
        }
    }

    pub fn is_adapted(&self) -> bool {
        matches!(self, Self::LowRank(_))
    }

    /// Weight of the underlying linear layer (without any adapter delta).
    pub fn base_weight(&self) -> &Tensor {
        match self {
            Self::Plain(l) => l.weight(),
            Self::LowRank(l) => l.base().weight(),
        }
    }

    /// Wrap this projection in a fresh adapter. Fails if one is already present.
    pub fn inject(&mut self, rank: usize, alpha: f64, vb: VarBuilder) -> Result<()> {
        match self {
            Self::Plain(linear) => {
                let adapted = LoraLinear::new(linear.clone(), rank, alpha, vb)?;
                *self = Self::LowRank(adapted);
                Ok(())
            }
            Self::LowRank(_) => Err(Error::Msg(
                "projection already carries a low-rank adapter".into(),
            )),
        }
    }

    /// Fold the adapter into `weight` (the variable backing the base layer)
    /// and revert to [`Projection::Plain`]. Returns `false` for plain layers.
    pub fn merge_into(&mut self, weight: &Var) -> Result<bool> {
        let Self::LowRank(adapted) = self else {
            return Ok(false);
        };
        let merged = (adapted.base().weight() + adapted.delta_weight()?)?;
        weight.set(&merged)?;
        // The base layer shares storage with `weight`, so it now sees the merged values.
        *self = Self::Plain(adapted.base().clone());
        Ok(true)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn matmul_reshape_3d() {
        let dev = Device::Cpu;
        let x = Tensor::ones((2, 3, 4), DType::F32, &dev).unwrap();
        let w_t = Tensor::ones((4, 5), DType::F32, &dev).unwrap();
        let y = matmul_reshape(&x, &w_t).unwrap();
        assert_eq!(y.dims(), &[2, 3, 5]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|&e| (e - 4.0).abs() < 1e-6));
    }

    #[test]
    fn fresh_adapter_is_a_no_op() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut proj = Projection::new(8, 6, vb.pp("v_proj")).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 5, 8), &dev).unwrap();
        let before = proj.forward(&x).unwrap();

        proj.inject(2, 1.0, vb.pp("v_proj")).unwrap();
        assert!(proj.is_adapted());
        let after = proj.forward(&x).unwrap();
        assert_eq!(max_abs_diff(&before, &after), 0.0);

        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"v_proj.lora_a".to_string()));
        assert!(names.contains(&"v_proj.lora_b".to_string()));
    }

    #[test]
    fn double_injection_is_rejected() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut proj = Projection::new(4, 4, vb.pp("q_proj")).unwrap();
        proj.inject(2, 1.0, vb.pp("q_proj")).unwrap();
        assert!(proj.inject(2, 1.0, vb.pp("q_proj")).is_err());
    }

    #[test]
    fn merge_preserves_output() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut proj = Projection::new(8, 6, vb.pp("out_proj")).unwrap();
        proj.inject(4, 2.0, vb.pp("out_proj")).unwrap();

        // Simulate training: give B non-zero values.
        let b = varmap
            .data()
            .lock()
            .unwrap()
            .get("out_proj.lora_b")
            .cloned()
            .unwrap();
        b.set(&Tensor::randn(0f32, 0.5f32, (6, 4), &dev).unwrap())
            .unwrap();

        let x = Tensor::randn(0f32, 1f32, (3, 8), &dev).unwrap();
        let adapted = proj.forward(&x).unwrap();

        let weight = varmap
            .data()
            .lock()
            .unwrap()
            .get("out_proj.weight")
            .cloned()
            .unwrap();
        assert!(proj.merge_into(&weight).unwrap());
        assert!(!proj.is_adapted());
        let merged = proj.forward(&x).unwrap();
        assert!(max_abs_diff(&adapted, &merged) < 1e-4);

        // A plain layer has nothing to merge.
        assert!(!proj.merge_into(&weight).unwrap());
    }
}
