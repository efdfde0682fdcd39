//! Traces failing Java permission checks in a live JVM.
//!
//! permscope attaches over JDWP, stops the target whenever a stack-based
//! permission check is about to fail, captures the checked context and
//! reports the cheapest ways to make the check pass: grants to the components
//! on the stack, privilege-elevation boundaries, or a mix of both.

pub mod boundary;
pub mod capture;
pub mod dispatch;
mod error;
pub mod helper;
pub mod proxy;
pub mod report;
pub mod resolve;
pub mod services;
pub mod session;
pub mod transport;

pub use error::{TraceError, TraceResult};
pub use session::Session;
