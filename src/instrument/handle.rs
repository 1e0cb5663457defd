//! Single-owner access to a shared instrument.
//!
//! A sweep and a telemetry loop may both be pointed at the same physical
//! instrument, but only one of them may drive it. [`InstrumentHandle::acquire`]
//! hands out an exclusive [`InstrumentLease`] or fails immediately with
//! [`DaqError::Busy`], naming the current owner. Nothing is sent to the
//! instrument on the failure path.

use super::{Instrument, InstrumentProfile};
use crate::error::{DaqError, DaqResult};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Cloneable reference to one instrument.
#[derive(Clone)]
pub struct InstrumentHandle {
    id: Arc<str>,
    profile: InstrumentProfile,
    instrument: Arc<tokio::sync::Mutex<Instrument>>,
    owner: Arc<Mutex<Option<String>>>,
}

impl InstrumentHandle {
    /// Take ownership of `instrument`.
    pub fn new(instrument: Instrument) -> Self {
        Self {
            id: Arc::from(instrument.id()),
            profile: *instrument.profile(),
            instrument: Arc::new(tokio::sync::Mutex::new(instrument)),
            owner: Arc::new(Mutex::new(None)),
        }
    }

    /// Instrument identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capability profile, readable without acquiring the instrument.
    pub fn profile(&self) -> &InstrumentProfile {
        &self.profile
    }

    /// Description of the current owner, if any.
    pub fn owner(&self) -> Option<String> {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the instrument is currently leased.
    pub fn is_busy(&self) -> bool {
        self.owner().is_some()
    }

    /// Claim exclusive use for `owner`, or fail with `Busy` without waiting.
    pub fn acquire(&self, owner: &str) -> DaqResult<InstrumentLease> {
        let mut slot = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = match self.instrument.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                return Err(DaqError::Busy {
                    instrument: self.id.to_string(),
                    owner: slot.clone().unwrap_or_else(|| "another operation".to_string()),
                })
            }
        };
        *slot = Some(owner.to_string());
        debug!(instrument = %self.id, owner, "instrument acquired");
        Ok(InstrumentLease {
            guard,
            owner: self.owner.clone(),
        })
    }
}

impl std::fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .finish()
    }
}

/// Exclusive access to an instrument; released on drop.
pub struct InstrumentLease {
    guard: OwnedMutexGuard<Instrument>,
    owner: Arc<Mutex<Option<String>>>,
}

impl Deref for InstrumentLease {
    type Target = Instrument;

    fn deref(&self) -> &Instrument {
        &self.guard
    }
}

impl DerefMut for InstrumentLease {
    fn deref_mut(&mut self) -> &mut Instrument {
        &mut self.guard
    }
}

impl Drop for InstrumentLease {
    fn drop(&mut self) {
        // Clear while the instrument mutex is still held so a racing
        // `acquire` never sees a free mutex with a stale owner.
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!(instrument = %self.guard.id(), "instrument released");
    }
}
