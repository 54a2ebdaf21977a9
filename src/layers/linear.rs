//! Dense map on the feature axis: `y = dropout(scale · (x Wᵀ + b))`.
//!
//! `scale` is an optional scalar argument (default 1.0), which lets a
//! routed argument change the layer's behaviour per call.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::layers::{dropout_mask, CallCtx, Transform, TransformOutput, Vjp};
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::tensor::{feature_dim, from_rows, to_rows, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Linear {
    /// `W ∈ R^{d_out × d_in}`
    pub weight: Array2<f32>,

    /// `b ∈ R^{d_out}`
    pub bias: Array1<f32>,

    /// Dropout probability applied to the output while training.
    pub dropout: f32,
}

impl Linear {
    /// Gaussian init with std `1/sqrt(d_in)`, zero bias.
    pub fn new(d_in: usize, d_out: usize, dropout: f32, seed: u64) -> Self {
        Self {
            weight: init_weight(d_out, d_in, seed),
            bias: Array1::zeros(d_out),
            dropout,
        }
    }

    pub fn from_weights(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self {
            weight,
            bias,
            dropout: 0.0,
        }
    }

    pub fn d_in(&self) -> usize {
        self.weight.ncols()
    }

    pub fn d_out(&self) -> usize {
        self.weight.nrows()
    }

    fn check_input(&self, x: &Tensor) -> Result<()> {
        let d = feature_dim(x)?;
        if d != self.d_in() {
            return Err(EngineError::shape("linear input", &[d], &[self.d_in()]));
        }
        Ok(())
    }

    /// Shared by `forward` and `vjp` so both draw the same dropout mask.
    fn run(&self, x: &Tensor, ctx: &mut CallCtx<'_>, args: &ArgBundle) -> Result<LinearCache> {
        self.check_input(x)?;
        let scale = args.scalar("scale").unwrap_or(1.0);
        let rows = to_rows(x)?;
        let z = rows.dot(&self.weight.t()) + &self.bias;
        let mut y = from_rows(z, x)? * scale;
        let mask = dropout_mask(y.shape(), self.dropout, ctx);
        if let Some(m) = &mask {
            y *= m;
        }
        Ok(LinearCache {
            rows,
            y,
            mask,
            scale,
        })
    }
}

struct LinearCache {
    rows: Array2<f32>,
    y: Tensor,
    mask: Option<Tensor>,
    scale: f32,
}

impl Transform for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&self, x: &Tensor, ctx: &mut CallCtx<'_>, args: &ArgBundle) -> Result<TransformOutput> {
        Ok(TransformOutput::plain(self.run(x, ctx, args)?.y))
    }

    fn vjp(
        &self,
        x: &Tensor,
        grad_output: &Tensor,
        ctx: &mut CallCtx<'_>,
        args: &ArgBundle,
        grads: &mut GradScope<'_>,
    ) -> Result<Vjp> {
        let cache = self.run(x, ctx, args)?;
        crate::tensor::ensure_same_shape("linear grad_output", grad_output, &cache.y)?;

        let mut dz = grad_output * cache.scale;
        if let Some(m) = &cache.mask {
            dz *= m;
        }
        let dz_rows = to_rows(&dz)?;

        grads.accumulate("weight", dz_rows.t().dot(&cache.rows).into_dyn())?;
        grads.accumulate("bias", dz_rows.sum_axis(Axis(0)).into_dyn())?;

        let dx = from_rows(dz_rows.dot(&self.weight), x)?;
        Ok(Vjp {
            output: TransformOutput::plain(cache.y),
            grad_input: dx,
        })
    }

    fn param_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

pub(crate) fn init_weight(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let std = 1.0 / (cols.max(1) as f32).sqrt();
    let mut rng = StdRng::seed_from_u64(seed);
    match Normal::new(0.0f32, std) {
        Ok(dist) => Array2::from_shape_simple_fn((rows, cols), || dist.sample(&mut rng)),
        Err(_) => Array2::zeros((rows, cols)),
    }
}
