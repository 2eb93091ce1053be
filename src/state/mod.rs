pub mod aggregator;
pub mod result;
pub mod session;
pub mod stats;

pub use aggregator::*;
pub use result::*;
pub use session::*;
pub use stats::*;
