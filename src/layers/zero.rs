use crate::error::Result;
use crate::layers::{CallCtx, Transform, TransformOutput, Vjp};
use crate::learning::grads::GradScope;
use crate::routing::ArgBundle;
use crate::tensor::Tensor;

/// Always returns zeros of the input's shape.
#[derive(Clone, Copy, Debug, Default)]
pub struct Zero;

impl Transform for Zero {
    fn name(&self) -> &'static str {
        "zero"
    }

    fn forward(&self, x: &Tensor, _ctx: &mut CallCtx<'_>, _args: &ArgBundle) -> Result<TransformOutput> {
        Ok(TransformOutput::plain(Tensor::zeros(x.raw_dim())))
    }

    fn vjp(
        &self,
        x: &Tensor,
        _grad_output: &Tensor,
        _ctx: &mut CallCtx<'_>,
        _args: &ArgBundle,
        _grads: &mut GradScope<'_>,
    ) -> Result<Vjp> {
        Ok(Vjp {
            output: TransformOutput::plain(Tensor::zeros(x.raw_dim())),
            grad_input: Tensor::zeros(x.raw_dim()),
        })
    }
}
