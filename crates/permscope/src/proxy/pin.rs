use std::future::Future;

use permscope_jdwp::wire::{
    types::ERROR_INVALID_OBJECT, JdwpClient, JdwpError, ObjectId,
};

use crate::TraceResult;

/// Attempts made to create-and-pin one remote object before giving up.
pub const PIN_RETRIES: usize = 10;

/// Remote objects this side has protected from collection.
///
/// Pins are released with [`PinScope::release`]; a scope dropped while still
/// holding pins leaks them in the target and logs a warning.
#[derive(Debug)]
pub struct PinScope {
    jdwp: JdwpClient,
    pinned: Vec<ObjectId>,
}

impl PinScope {
    pub fn new(jdwp: JdwpClient) -> Self {
        Self {
            jdwp,
            pinned: Vec::new(),
        }
    }

    pub fn pinned(&self) -> &[ObjectId] {
        &self.pinned
    }

    /// Creates a remote object with `create` and latches it with
    /// `DisableCollection`, recreating it while the target reports it was
    /// already collected.
    pub async fn acquire<F, Fut>(&mut self, mut create: F) -> TraceResult<ObjectId>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TraceResult<ObjectId>>,
    {
        let mut last = JdwpError::VmError(ERROR_INVALID_OBJECT);
        for attempt in 1..=PIN_RETRIES {
            let object = create().await?;
            if object == 0 {
                return Ok(0);
            }
            match self.jdwp.object_reference_disable_collection(object).await {
                Ok(()) => {
                    self.pinned.push(object);
                    return Ok(object);
                }
                Err(JdwpError::VmError(ERROR_INVALID_OBJECT)) => {
                    tracing::debug!(
                        target = "permscope.proxy",
                        object,
                        attempt,
                        "object collected before it could be pinned; retrying"
                    );
                    last = JdwpError::VmError(ERROR_INVALID_OBJECT);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last.into())
    }

    /// Pins an object that already exists; there is nothing to recreate if it
    /// is gone.
    pub async fn pin_existing(&mut self, object: ObjectId) -> TraceResult<()> {
        if object == 0 || self.pinned.contains(&object) {
            return Ok(());
        }
        self.jdwp.object_reference_disable_collection(object).await?;
        self.pinned.push(object);
        Ok(())
    }

    /// Re-enables collection for everything pinned through this scope.
    pub async fn release(mut self) -> TraceResult<()> {
        let pinned = std::mem::take(&mut self.pinned);
        let mut first_err = None;
        for object in pinned {
            match self.jdwp.object_reference_enable_collection(object).await {
                Ok(()) => {}
                // Already collected or the VM is gone; nothing left to release.
                Err(JdwpError::VmError(ERROR_INVALID_OBJECT)) => {}
                Err(err) if err.is_disconnect() => return Err(err.into()),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

impl Drop for PinScope {
    fn drop(&mut self) {
        if !self.pinned.is_empty() {
            tracing::warn!(
                target = "permscope.proxy",
                count = self.pinned.len(),
                "pin scope dropped without release; remote objects stay pinned"
            );
        }
    }
}
