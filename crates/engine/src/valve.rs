//! Valve command channel: the only code that writes `valveCommand`.
//!
//! Fire-and-forget. The write is acknowledged by the store; whether the
//! hardware follows is the reconciler's business.

use tracing::debug;

use crate::model::ValveCommand;
use crate::store::{self, keys, Store, StoreError};

#[derive(Clone)]
pub struct ValveChannel<S: Store> {
    store: S,
}

impl<S: Store> ValveChannel<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Write the desired valve state.
    pub async fn issue(&self, desired: bool, now: i64) -> Result<ValveCommand, StoreError> {
        let cmd = ValveCommand {
            open: desired,
            issued_at: now,
        };
        store::write(&self.store, keys::VALVE_COMMAND, &cmd).await?;
        debug!(open = desired, "valve command issued");
        Ok(cmd)
    }

    /// The command currently in the store, if any.
    pub async fn current(&self) -> Result<Option<ValveCommand>, StoreError> {
        store::read(&self.store, keys::VALVE_COMMAND).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
