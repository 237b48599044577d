pub mod daemon;
pub mod diff;
pub mod sync;
