//! Contrastive training loop and the devices it runs on.

mod device;
mod simclr;

pub use device::{CpuDevice, TrainingDevice};
pub use simclr::SimClrTrainer;
