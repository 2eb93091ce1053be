pub mod anomaly;
pub mod tracer;

pub use anomaly::*;
pub use tracer::*;
