//! Blocking synchronization primitives used by admission control

pub mod priority_semaphore;
pub mod semaphore;

pub use priority_semaphore::{PermitGuard, PrioritySemaphore};
pub use semaphore::Semaphore;
