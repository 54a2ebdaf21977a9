//! Two-layer feed-forward block: `W2 · dropout(tanh(W1 x + b1)) + b2`.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::layers::linear::init_weight;
use crate::layers::{dropout_mask, CallCtx, Transform, TransformOutput, Vjp};
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::tensor::{ensure_same_shape, feature_dim, from_rows, to_rows, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedForward {
    /// `W1 ∈ R^{hidden × d}`
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,

    /// `W2 ∈ R^{d × hidden}`
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,

    /// Dropout on the hidden activation.
    pub dropout: f32,
}

impl FeedForward {
    pub fn new(d: usize, hidden: usize, dropout: f32, seed: u64) -> Self {
        Self {
            w1: init_weight(hidden, d, seed),
            b1: Array1::zeros(hidden),
            w2: init_weight(d, hidden, seed.wrapping_add(1)),
            b2: Array1::zeros(d),
            dropout,
        }
    }

    fn run(&self, x: &Tensor, ctx: &mut CallCtx<'_>) -> Result<FfnCache> {
        let d = feature_dim(x)?;
        if d != self.w1.ncols() {
            return Err(EngineError::shape("feed-forward input", &[d], &[self.w1.ncols()]));
        }
        let rows = to_rows(x)?;
        let act = (rows.dot(&self.w1.t()) + &self.b1).mapv(f32::tanh);
        let mask = dropout_mask(act.shape(), self.dropout, ctx)
            .map(|m| m.into_dimensionality::<ndarray::Ix2>())
            .transpose()?;
        let dropped = match &mask {
            Some(m) => &act * m,
            None => act.clone(),
        };
        let out = dropped.dot(&self.w2.t()) + &self.b2;
        Ok(FfnCache {
            rows,
            act,
            mask,
            dropped,
            y: from_rows(out, x)?,
        })
    }
}

struct FfnCache {
    rows: Array2<f32>,
    act: Array2<f32>,
    mask: Option<Array2<f32>>,
    dropped: Array2<f32>,
    y: Tensor,
}

impl Transform for FeedForward {
    fn name(&self) -> &'static str {
        "feed_forward"
    }

    fn forward(&self, x: &Tensor, ctx: &mut CallCtx<'_>, _args: &ArgBundle) -> Result<TransformOutput> {
        Ok(TransformOutput::plain(self.run(x, ctx)?.y))
    }

    fn vjp(
        &self,
        x: &Tensor,
        grad_output: &Tensor,
        ctx: &mut CallCtx<'_>,
        _args: &ArgBundle,
        grads: &mut GradScope<'_>,
    ) -> Result<Vjp> {
        let cache = self.run(x, ctx)?;
        ensure_same_shape("feed-forward grad_output", grad_output, &cache.y)?;
        let dy = to_rows(grad_output)?;

        grads.accumulate("w2", dy.t().dot(&cache.dropped).into_dyn())?;
        grads.accumulate("b2", dy.sum_axis(Axis(0)).into_dyn())?;

        let mut d_act = dy.dot(&self.w2);
        if let Some(m) = &cache.mask {
            d_act *= m;
        }
        let d_pre = d_act * &cache.act.mapv(|a| 1.0 - a * a);

        grads.accumulate("w1", d_pre.t().dot(&cache.rows).into_dyn())?;
        grads.accumulate("b1", d_pre.sum_axis(Axis(0)).into_dyn())?;

        Ok(Vjp {
            output: TransformOutput::plain(cache.y),
            grad_input: from_rows(d_pre.dot(&self.w1), x)?,
        })
    }

    fn param_count(&self) -> usize {
        self.w1.len() + self.b1.len() + self.w2.len() + self.b2.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::grads::ParamGrads;
    use ndarray::IxDyn;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_shapes_and_param_count() {
        let ffn = FeedForward::new(4, 8, 0.0, 5);
        assert_eq!(ffn.param_count(), 4 * 8 + 8 + 8 * 4 + 4);
        let x = Tensor::ones(IxDyn(&[2, 3, 4]));
        let mut rng = StdRng::seed_from_u64(0);
        let mut ctx = CallCtx { rng: &mut rng, training: true };
        let out = ffn.forward(&x, &mut ctx, &ArgBundle::new()).unwrap();
        assert_eq!(out.output.shape(), &[2, 3, 4]);
        assert!(out.state.is_empty());
    }

    #[test]
    fn test_vjp_output_equals_forward_under_dropout() {
        let ffn = FeedForward::new(4, 8, 0.3, 5);
        let mut init = StdRng::seed_from_u64(9);
        let x = crate::tensor::randn(&[1, 5, 4], 1.0, &mut init);
        let dy = Tensor::ones(x.raw_dim());

        let mut rng = StdRng::seed_from_u64(21);
        let mut replay = rng.clone();
        let fwd = ffn
            .forward(&x, &mut CallCtx { rng: &mut rng, training: true }, &ArgBundle::new())
            .unwrap();

        let mut grads = ParamGrads::new();
        let vjp = ffn
            .vjp(
                &x,
                &dy,
                &mut CallCtx { rng: &mut replay, training: true },
                &ArgBundle::new(),
                &mut grads.scope("ffn"),
            )
            .unwrap();
        assert_eq!(vjp.output.output, fwd.output);
        assert_eq!(grads.len(), 4);
    }
}
