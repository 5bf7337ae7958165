pub mod layout;
pub mod log;
pub mod store;

pub use layout::JobPaths;
pub use log::{LogSink, LogWriter};
pub use store::{JobStore, RecoveryReport};
