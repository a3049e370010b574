//! 核心层：错误类型、运行监管、优雅关闭

pub mod error;
pub mod session_supervisor;
pub mod shutdown;

pub use error::ChatError;
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{ShutdownManager, ShutdownReason};
