//! Causal cumulative memory with chunk-carried statistics.
//!
//! For input `x ∈ R^{B × T × D}` and values `v_t = W x_t`:
//!
//! ```text
//! S_t = S_0 + Σ_{s ≤ t} v_s          running sum
//! Z_t = Z_0 + t + 1                  running count
//! y_t = S_t / Z_t
//! ```
//!
//! `S_0`, `Z_0` come from the optional `states` argument (the slice of a
//! previous chunk's stacked state) and default to zero. The layer emits
//! the final `S` (`[B, D]`) and `Z` (`[B]`) as auxiliary state and the norm of
//! `S` per batch row as debug telemetry. Incoming state is treated as a
//! constant: no gradient flows into a previous chunk.

use ndarray::{s, Array1, Array2, Array3, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::layers::linear::init_weight;
use crate::layers::{CallCtx, Transform, TransformOutput, Vjp};
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::state::StateMap;
use crate::tensor::{ensure_same_shape, Tensor};

/// Argument name under which prior state is supplied.
pub const STATES_ARG: &str = "states";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CumulativeMemory {
    /// Value projection `W ∈ R^{D × D}`.
    pub w_value: Array2<f32>,
}

impl CumulativeMemory {
    pub fn new(d: usize, seed: u64) -> Self {
        Self {
            w_value: init_weight(d, d, seed),
        }
    }

    fn prior(&self, args: &ArgBundle, batch: usize) -> Result<(Array2<f32>, Array1<f32>)> {
        let d = self.w_value.nrows();
        let Some(states) = args.state(STATES_ARG) else {
            return Ok((Array2::zeros((batch, d)), Array1::zeros(batch)));
        };
        let s0 = match states.get("S") {
            Some(t) => t.clone().into_dimensionality::<Ix2>()?,
            None => Array2::zeros((batch, d)),
        };
        let z0 = match states.get("Z") {
            Some(t) => t.clone().into_dimensionality::<ndarray::Ix1>()?,
            None => Array1::zeros(batch),
        };
        if s0.dim() != (batch, d) || z0.len() != batch {
            return Err(EngineError::shape(
                "prior memory state",
                &[s0.nrows(), s0.ncols(), z0.len()],
                &[batch, d, batch],
            ));
        }
        Ok((s0, z0))
    }

    fn run(&self, x: &Tensor, args: &ArgBundle) -> Result<MemoryCache> {
        let x3 = x.as_standard_layout().into_owned().into_dimensionality::<Ix3>()?;
        let (batch, steps, d) = x3.dim();
        if d != self.w_value.ncols() {
            return Err(EngineError::shape("memory input", &[d], &[self.w_value.ncols()]));
        }
        let (s0, z0) = self.prior(args, batch)?;

        let mut y = Array3::<f32>::zeros((batch, steps, d));
        let mut counts = Array2::<f32>::zeros((batch, steps));
        let mut s_final = s0;
        for b in 0..batch {
            let mut running = s_final.row(b).to_owned();
            for t in 0..steps {
                let v = self.w_value.dot(&x3.slice(s![b, t, ..]));
                running += &v;
                let count = z0[b] + (t + 1) as f32;
                counts[[b, t]] = count;
                y.slice_mut(s![b, t, ..]).assign(&(&running / count));
            }
            s_final.row_mut(b).assign(&running);
        }
        let z_final = z0 + steps as f32;

        let s_norm = s_final.map_axis(Axis(1), |row| row.dot(&row).sqrt());
        let state = StateMap::from([
            ("S".to_string(), s_final.into_dyn()),
            ("Z".to_string(), z_final.into_dyn()),
        ]);
        let debug = StateMap::from([("s_norm".to_string(), s_norm.into_dyn())]);

        Ok(MemoryCache {
            x3,
            counts,
            output: TransformOutput {
                output: y.into_dyn(),
                state,
                debug,
            },
        })
    }
}

struct MemoryCache {
    x3: Array3<f32>,
    counts: Array2<f32>,
    output: TransformOutput,
}

impl Transform for CumulativeMemory {
    fn name(&self) -> &'static str {
        "cumulative_memory"
    }

    fn forward(&self, x: &Tensor, _ctx: &mut CallCtx<'_>, args: &ArgBundle) -> Result<TransformOutput> {
        Ok(self.run(x, args)?.output)
    }

    fn vjp(
        &self,
        x: &Tensor,
        grad_output: &Tensor,
        _ctx: &mut CallCtx<'_>,
        args: &ArgBundle,
        grads: &mut GradScope<'_>,
    ) -> Result<Vjp> {
        let cache = self.run(x, args)?;
        ensure_same_shape("memory grad_output", grad_output, &cache.output.output)?;
        let dy = grad_output.view().into_dimensionality::<Ix3>()?;
        let (batch, steps, d) = dy.dim();

        // dv_s = Σ_{t ≥ s} dy_t / Z_t
        let mut dv = Array3::<f32>::zeros((batch, steps, d));
        for b in 0..batch {
            let mut acc = Array1::<f32>::zeros(d);
            for t in (0..steps).rev() {
                acc += &(&dy.slice(s![b, t, ..]) / cache.counts[[b, t]]);
                dv.slice_mut(s![b, t, ..]).assign(&acc);
            }
        }

        let dv_rows = dv.into_shape_with_order((batch * steps, d))?;
        let x_rows = cache.x3.into_shape_with_order((batch * steps, d))?;
        grads.accumulate("w_value", dv_rows.t().dot(&x_rows).into_dyn())?;

        let dx = dv_rows
            .dot(&self.w_value)
            .into_shape_with_order((batch, steps, d))?
            .into_dyn();
        Ok(Vjp {
            output: cache.output,
            grad_input: dx,
        })
    }

    fn param_count(&self) -> usize {
        self.w_value.len()
    }
}
