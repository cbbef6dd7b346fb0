pub mod chain;
pub mod eq;
pub mod filters;

pub use chain::{DspChain, DspConfig};
pub use eq::{preset as eq_preset, EqGains, ThreeBandEq};
