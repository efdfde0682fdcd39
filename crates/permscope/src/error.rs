use permscope_config::ConfigError;
use permscope_jdwp::wire::{JdwpError, ObjectId};
use thiserror::Error;

use crate::helper::HelperError;

pub type TraceResult<T> = Result<T, TraceError>;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("jdwp: {0}")]
    Jdwp(#[from] JdwpError),

    /// An expected remote class or member does not exist in the target.
    #[error("remote layout mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("remote call threw {class_name}")]
    RemoteException {
        class_name: String,
        exception: ObjectId,
    },

    /// `VirtualMachineError` or `ThreadDeath` raised inside the target.
    #[error("target VM raised {class_name}")]
    VmFatal { class_name: String },

    #[error("helper: {0}")]
    Helper(#[from] HelperError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot attach to {address}: {reason}")]
    Transport { address: String, reason: String },
}

impl TraceError {
    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        TraceError::ProtocolMismatch(message.into())
    }

    /// Conditions that must never be swallowed by a fallback path.
    pub fn is_fatal(&self) -> bool {
        match self {
            TraceError::VmFatal { .. } | TraceError::Transport { .. } => true,
            TraceError::Jdwp(err) => err.is_disconnect(),
            TraceError::Helper(HelperError::Remote(inner)) => inner.is_fatal(),
            _ => false,
        }
    }
}
