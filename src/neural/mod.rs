pub mod learner;
pub mod model_io;
pub mod qnet;

// Re-export key components for convenience
pub use learner::{DqnLearner, NextActionProvider, PolicyUpdateResult};
pub use qnet::QNetwork;
