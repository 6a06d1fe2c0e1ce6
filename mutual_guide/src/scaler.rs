use burn::{module::{AutodiffModule, ModuleVisitor, ParamId}, optim::{GradientsParams, Optimizer}, tensor::{backend::{AutodiffBackend, Backend}, ElementConversion, Tensor}};

use crate::config::Precision;

const INIT_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: usize = 2000;

/// What happened to the parameters in one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Stepped,
    /// Gradients overflowed at the current loss scale; parameters untouched.
    Skipped,
}

/// Dynamic loss scaling.
///
/// The loss is multiplied by a large factor before backward so small gradients
/// survive reduced precision. Gradients are divided back before the optimizer
/// sees them; a non-finite gradient skips the step and halves the scale, and
/// `GROWTH_INTERVAL` clean steps in a row double it.
#[derive(Debug, Clone)]
pub struct GradScaler {
    precision: Precision,
    scale: f64,
    growth_tracker: usize,
}

struct Unscale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    factor: f64,
    sums: Vec<Tensor<B::InnerBackend, 1>>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            let grad = grad.mul_scalar(self.factor);
            self.sums.push(grad.clone().sum());
            self.grads.register::<B::InnerBackend, D>(id.clone(), grad);
        }
    }
}

impl GradScaler {
    pub fn new(precision: Precision) -> Self {
        let scale = match precision {
            Precision::Full => 1.0,
            Precision::Mixed => INIT_SCALE,
        };
        Self {
            precision,
            scale,
            growth_tracker: 0,
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale
    }

    pub fn scale<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        match self.precision {
            Precision::Full => loss,
            Precision::Mixed => loss.mul_scalar(self.scale),
        }
    }

    /// Divides every gradient of `model` by the current scale in place and
    /// reports whether all of them are finite.
    pub fn unscale<B: AutodiffBackend, M: AutodiffModule<B>>(&self, model: &M, grads: &mut GradientsParams) -> bool {
        let mut visitor = Unscale::<B> {
            grads,
            factor: 1.0 / self.scale,
            sums: Vec::new(),
        };
        model.visit(&mut visitor);

        if visitor.sums.is_empty() {
            return true;
        }
        let total: f64 = Tensor::cat(visitor.sums, 0).sum().into_scalar().elem();
        total.is_finite()
    }

    /// Unscales, then either applies the optimizer or skips the step on
    /// overflow, and adapts the scale either way.
    pub fn step<B, M, O>(&mut self, lr: f64, model: M, mut grads: GradientsParams, optimizer: &mut O) -> (M, StepOutcome)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if self.precision == Precision::Full {
            return (optimizer.step(lr, model, grads), StepOutcome::Stepped);
        }

        let finite = self.unscale::<B, M>(&model, &mut grads);
        self.update(!finite);
        if finite {
            (optimizer.step(lr, model, grads), StepOutcome::Stepped)
        } else {
            (model, StepOutcome::Skipped)
        }
    }

    pub fn update(&mut self, found_inf: bool) {
        if self.precision == Precision::Full {
            return;
        }
        if found_inf {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
    }
}
