pub mod backend;
pub mod boxes;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod dataset;
pub mod detections;
pub mod ema;
pub mod error;
pub mod evaluation;
pub mod loss;
pub mod matcher;
pub mod model;
pub mod postprocess;
pub mod prefetch;
pub mod prior;
pub mod scaler;
pub mod schedule;
pub mod timer;
pub mod training;
pub mod visualize;
