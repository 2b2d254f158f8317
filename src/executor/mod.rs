pub mod parallel;
pub mod quote;
pub mod retry;
pub mod ssh;

pub use parallel::{DistResult, FlatMachine};
pub use ssh::{ExecOptions, ExecOutput, SshRunner};
