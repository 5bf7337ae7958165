pub mod handle;
pub mod runner;
pub mod traits;

pub use handle::{ProcessHandle, StopRequest};
pub use runner::{DEFAULT_TERMINATION_GRACE, ProcessRunner, RunRequest};
pub use traits::Executor;
