use std::collections::HashMap;

use burn::{module::{Module, ModuleMapper, ModuleVisitor, ParamId}, tensor::{backend::Backend, Tensor}};

/// Exponential moving average of a module's parameters.
///
/// The average is a separate, gradient-free copy; updating it only reads the
/// live weights. The effective decay ramps up from zero as
/// `decay * (1 - exp(-updates / tau))` so early averages follow the live
/// model closely.
#[derive(Debug, Clone)]
pub struct ModelEma<B: Backend, M: Module<B>> {
    ema: M,
    decay: f64,
    tau: f64,
    updates: usize,
    _backend: std::marker::PhantomData<B>,
}

struct ParamCollector<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, tensor: &Tensor<B, D>) {
        let numel = tensor.shape().num_elements();
        self.params.insert(id.clone(), tensor.clone().reshape([numel]));
    }
}

struct Blend<B: Backend> {
    live: HashMap<ParamId, Tensor<B, 1>>,
    decay: f64,
}

impl<B: Backend> ModuleMapper<B> for Blend<B> {
    fn map_float<const D: usize>(&mut self, id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        match self.live.remove(id) {
            Some(live) => {
                let live = live.reshape(tensor.shape());
                tensor.mul_scalar(self.decay) + live.mul_scalar(1.0 - self.decay)
            }
            None => tensor,
        }
    }
}

impl<B: Backend, M: Module<B>> ModelEma<B, M> {
    pub fn new(model: M, decay: f64, tau: f64) -> Self {
        Self {
            ema: model,
            decay,
            tau,
            updates: 0,
            _backend: std::marker::PhantomData,
        }
    }

    /// Continues an average that already absorbed `updates` steps, e.g. after a resume.
    pub fn with_updates(mut self, updates: usize) -> Self {
        self.updates = updates;
        self
    }

    /// Decay applied by the most recent update.
    pub fn decay(&self) -> f64 {
        self.decay * (1.0 - (-(self.updates as f64) / self.tau).exp())
    }

    pub fn updates(&self) -> usize {
        self.updates
    }

    pub fn ema(&self) -> &M {
        &self.ema
    }

    pub fn into_inner(self) -> M {
        self.ema
    }

    pub fn update(&mut self, live: &M) {
        self.updates += 1;
        let decay = self.decay();

        let mut collector = ParamCollector {
            params: HashMap::new(),
        };
        live.visit(&mut collector);

        let mut blend = Blend {
            live: collector.params,
            decay,
        };
        self.ema = self.ema.clone().map(&mut blend);
        if !blend.live.is_empty() {
            log::warn!("{} live parameters have no counterpart in the average", blend.live.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, nn::{Linear, LinearConfig}};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn weights(model: &Linear<TestBackend>) -> Vec<f32> {
        model.weight.val().into_data().convert::<f32>().value
    }

    struct Shift(f32);

    impl<B: Backend> ModuleMapper<B> for Shift {
        fn map_float<const D: usize>(&mut self, _id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
            tensor.add_scalar(self.0)
        }
    }

    // same parameter ids, different values
    fn pair() -> (Linear<TestBackend>, Linear<TestBackend>) {
        let start = LinearConfig::new(3, 2).init::<TestBackend>(&Default::default());
        let live = start.clone().map(&mut Shift(1.0));
        (start, live)
    }

    #[test]
    fn update_is_a_convex_combination() {
        let (start, live) = pair();
        let mut ema = ModelEma::new(start.clone(), 0.9998, 2.0);
        ema.update(&live);

        let d = ema.decay() as f32;
        assert!(d > 0.0 && d < 0.9998);
        for ((e, old), new) in weights(ema.ema()).iter().zip(weights(&start)).zip(weights(&live)) {
            let expected = d * old + (1.0 - d) * new;
            assert!((e - expected).abs() < 1e-5, "{e} != {expected}");
            assert!(*e >= old.min(new) - 1e-6 && *e <= old.max(new) + 1e-6);
        }
    }

    #[test]
    fn repeated_updates_converge_monotonically() {
        let (start, live) = pair();
        let mut ema = ModelEma::new(start, 0.5, 2.0);
        let target = weights(&live);
        let distance = |m: &Linear<TestBackend>| -> f32 {
            weights(m).iter().zip(target.iter()).map(|(a, b)| (a - b).abs()).sum()
        };

        let mut previous = distance(ema.ema());
        for _ in 0..20 {
            ema.update(&live);
            let current = distance(ema.ema());
            assert!(current <= previous + 1e-6);
            previous = current;
        }
        assert!(previous < 1e-3);
    }

    #[test]
    fn decay_ramps_towards_the_configured_value() {
        let model = LinearConfig::new(1, 1).init::<TestBackend>(&Default::default());
        let fresh = ModelEma::new(model.clone(), 0.9998, 2000.0);
        assert_eq!(fresh.decay(), 0.0);

        let resumed = ModelEma::new(model, 0.9998, 2000.0).with_updates(20_000);
        assert_eq!(resumed.updates(), 20_000);
        assert!(resumed.decay() > 0.999 && resumed.decay() < 0.9998);
    }
}
