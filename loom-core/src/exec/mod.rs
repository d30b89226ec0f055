//! Command execution gateway
//!
//! The single choke point for spawning subprocesses: validation, path
//! confinement, bounded concurrency, timeouts with process-group kill and
//! retry of transient git lock contention.

mod gateway;
mod invocation;
mod result;
mod runner;
mod validate;

pub use gateway::{
    is_transient_failure, CommandGateway, ExecRequest, GatewayConfig, RetryPolicy,
    TRANSIENT_PATTERNS,
};
pub use invocation::Invocation;
pub use result::{ErrorKind, ExecError, ProcessOutput};
pub use runner::{ProcessRunner, ProcessSpec, RawOutput, SystemProcessRunner};
pub use validate::{
    split_command, CommandPolicy, PathConfinement, ShellMode, DEFAULT_ALLOWED_COMMANDS,
    DEFAULT_BLOCKED_COMMANDS,
};

