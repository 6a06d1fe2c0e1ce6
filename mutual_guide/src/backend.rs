//! Backend selection for the binary.
//!
//! Chosen at compile time through cargo features, highest priority first:
//!
//! - `backend-tch`: LibTorch, CPU or CUDA
//! - `backend-wgpu`: WGPU on the best available adapter
//! - `backend-ndarray` (default): NdArray on the CPU
//!
//! [`MixedInnerBackend`] is what `Precision::Mixed` runs on. Only LibTorch
//! offers a half precision float element in burn 0.12; NdArray and WGPU compute
//! in `f32` there and mixed precision falls back to loss scaling alone.

use burn::tensor::backend::Backend;

#[cfg(feature = "backend-tch")]
mod selected {
    pub type InnerBackend = burn::backend::LibTorch<f32>;
    pub type MixedInnerBackend = burn::backend::LibTorch<burn::tensor::f16>;
    pub type Device = burn::backend::libtorch::LibTorchDevice;

    pub fn default_device() -> Device {
        Device::default()
    }
}

#[cfg(all(feature = "backend-wgpu", not(feature = "backend-tch")))]
mod selected {
    use burn::backend::wgpu::AutoGraphicsApi;

    pub type InnerBackend = burn::backend::Wgpu<AutoGraphicsApi, f32, i32>;
    pub type MixedInnerBackend = InnerBackend;
    pub type Device = burn::backend::wgpu::WgpuDevice;

    pub fn default_device() -> Device {
        Device::BestAvailable
    }
}

#[cfg(all(feature = "backend-ndarray", not(any(feature = "backend-tch", feature = "backend-wgpu"))))]
mod selected {
    pub type InnerBackend = burn::backend::NdArray<f32>;
    pub type MixedInnerBackend = InnerBackend;
    pub type Device = burn::backend::ndarray::NdArrayDevice;

    pub fn default_device() -> Device {
        Device::default()
    }
}

#[cfg(not(any(feature = "backend-tch", feature = "backend-wgpu", feature = "backend-ndarray")))]
compile_error!("enable one of the `backend-ndarray`, `backend-wgpu` or `backend-tch` features");

pub use selected::{Device, InnerBackend, MixedInnerBackend};

/// Backend used for training, with autodiff support.
pub type TrainBackend = burn::backend::Autodiff<InnerBackend>;
/// Training backend for `Precision::Mixed`.
pub type MixedTrainBackend = burn::backend::Autodiff<MixedInnerBackend>;

/// Whether [`MixedInnerBackend`] computes in a narrower float than [`InnerBackend`].
pub fn reduced_precision_available() -> bool {
    float_bytes::<MixedInnerBackend>() < float_bytes::<InnerBackend>()
}

fn float_bytes<B: Backend>() -> usize {
    std::mem::size_of::<B::FloatElem>()
}

pub fn default_device() -> Device {
    let device = selected::default_device();
    log::info!("Device initialized: {:?}", device);
    device
}

/// Blocks until all work queued on `device` has completed.
pub fn synchronize<B: Backend>(device: &B::Device) {
    B::sync(device);
}

pub fn device_name<B: Backend>(device: &B::Device) -> String {
    format!("{} {:?}", B::name(), device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_backend_is_half_precision_exactly_when_available() {
        let mixed = float_bytes::<MixedInnerBackend>();
        assert_eq!(float_bytes::<InnerBackend>(), 4);
        assert_eq!(reduced_precision_available(), mixed == 2);
        #[cfg(feature = "backend-tch")]
        assert_eq!(mixed, 2);
        #[cfg(not(feature = "backend-tch"))]
        assert_eq!(mixed, 4);
    }
}
