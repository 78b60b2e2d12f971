mod maintenance;
mod tracker;
mod verification_recheck;

pub use maintenance::*;
pub use verification_recheck::*;
