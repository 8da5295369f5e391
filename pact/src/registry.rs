//! Handle registry.
//!
//! Maps opaque integer handles to pacts, interactions, messages and
//! verifiers. Ids are issued per kind, start at 1 and are never reused, so a
//! stale handle can only ever fail to resolve. All state sits behind a single
//! mutex; configuration calls are rare next to request handling.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PactError, Result};
use crate::model::{Pact, PactInteraction};
use crate::verifier::Verifier;

/// Kind of entity a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// A pact
    Pact,
    /// An HTTP interaction
    Interaction,
    /// An asynchronous or synchronous message
    Message,
    /// A verifier
    Verifier,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pact => "pact",
            Self::Interaction => "interaction",
            Self::Message => "message",
            Self::Verifier => "verifier",
        })
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident => $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Wrap a raw handle value.
            #[must_use]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }

            /// Raw handle value.
            #[must_use]
            pub const fn id(self) -> u32 {
                self.0
            }

            const fn invalid(self) -> PactError {
                PactError::InvalidHandle { kind: $kind, id: self.0 }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

handle_type!(
    /// Handle to a pact.
    PactHandle => HandleKind::Pact
);
handle_type!(
    /// Handle to an HTTP interaction.
    InteractionHandle => HandleKind::Interaction
);
handle_type!(
    /// Handle to an asynchronous or synchronous message.
    MessageHandle => HandleKind::Message
);
handle_type!(
    /// Handle to a verifier.
    VerifierHandle => HandleKind::Verifier
);

/// Id-keyed storage with monotonically increasing ids.
///
/// Ids run from 1 to `u32::MAX`; once the last has been issued the arena
/// stops accepting items rather than wrapping.
#[derive(Debug)]
struct Arena<T> {
    next: Option<u32>,
    items: HashMap<u32, T>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            next: Some(1),
            items: HashMap::new(),
        }
    }

    const fn exhausted(&self) -> bool {
        self.next.is_none()
    }

    fn insert(&mut self, item: T) -> Option<u32> {
        let id = self.next?;
        self.next = id.checked_add(1);
        self.items.insert(id, item);
        Some(id)
    }

    fn get(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    fn remove(&mut self, id: u32) -> Option<T> {
        self.items.remove(&id)
    }
}

#[derive(Debug)]
struct PactEntry {
    pact: Pact,
    frozen: bool,
}

/// Position of an interaction inside its pact.
#[derive(Debug, Clone, Copy)]
struct InteractionRef {
    pact: PactHandle,
    index: usize,
}

struct RegistryState {
    pacts: Arena<PactEntry>,
    interactions: Arena<InteractionRef>,
    messages: Arena<InteractionRef>,
    verifiers: Arena<Arc<Mutex<Verifier>>>,
}

impl RegistryState {
    fn entry(&self, handle: PactHandle) -> Result<&PactEntry> {
        self.pacts.get(handle.id()).ok_or_else(|| handle.invalid())
    }

    fn entry_mut(&mut self, handle: PactHandle) -> Result<&mut PactEntry> {
        self.pacts.get_mut(handle.id()).ok_or_else(|| handle.invalid())
    }

    fn resolve(&self, kind: HandleKind, id: u32) -> Result<InteractionRef> {
        let arena = match kind {
            HandleKind::Message => &self.messages,
            _ => &self.interactions,
        };
        arena
            .get(id)
            .copied()
            .ok_or(PactError::InvalidHandle { kind, id })
    }

    fn mutable_entry(&mut self, handle: PactHandle) -> Result<&mut PactEntry> {
        let entry = self.entry_mut(handle)?;
        if entry.frozen {
            return Err(PactError::Frozen(entry.pact.label()));
        }
        Ok(entry)
    }
}

/// Registry of every live handle.
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("pacts", &state.pacts.items.len())
            .field("interactions", &state.interactions.items.len())
            .field("messages", &state.messages.items.len())
            .field("verifiers", &state.verifiers.items.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                pacts: Arena::new(),
                interactions: Arena::new(),
                messages: Arena::new(),
                verifiers: Arena::new(),
            }),
        }
    }

    /// Register a pact.
    ///
    /// Once every pact id has been issued the pact is dropped and the null
    /// handle 0, which never resolves, is returned.
    pub fn create_pact(&self, pact: Pact) -> PactHandle {
        let label = pact.label();
        let Some(id) = self.state.lock().pacts.insert(PactEntry { pact, frozen: false }) else {
            warn!(pact = %label, "Pact handles exhausted");
            return PactHandle::new(0);
        };
        debug!(handle = id, pact = %label, "Pact registered");
        PactHandle::new(id)
    }

    /// Destroy a pact together with its interaction and message handles.
    ///
    /// Returns `false` when the handle was not live.
    pub fn destroy_pact(&self, handle: PactHandle) -> bool {
        let mut state = self.state.lock();
        if state.pacts.remove(handle.id()).is_none() {
            return false;
        }
        state.interactions.items.retain(|_, r| r.pact != handle);
        state.messages.items.retain(|_, r| r.pact != handle);
        debug!(handle = handle.id(), "Pact destroyed");
        true
    }

    /// Read a pact.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn with_pact<R>(&self, handle: PactHandle, f: impl FnOnce(&Pact) -> R) -> Result<R> {
        let state = self.state.lock();
        state.entry(handle).map(|entry| f(&entry.pact))
    }

    /// Copy of a pact.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn pact(&self, handle: PactHandle) -> Result<Pact> {
        self.with_pact(handle, Clone::clone)
    }

    /// Mutate a pact that is not frozen.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or the closure's error.
    pub fn update_pact<R>(&self, handle: PactHandle, f: impl FnOnce(&mut Pact) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock();
        let entry = state.mutable_entry(handle)?;
        f(&mut entry.pact)
    }

    /// Mutate a pact regardless of its frozen state.
    ///
    /// Only used for bookkeeping that is not part of the contract itself.
    pub(crate) fn update_pact_unchecked<R>(
        &self,
        handle: PactHandle,
        f: impl FnOnce(&mut Pact) -> R,
    ) -> Result<R> {
        let mut state = self.state.lock();
        state.entry_mut(handle).map(|entry| f(&mut entry.pact))
    }

    /// Whether the pact rejects mutation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn is_frozen(&self, handle: PactHandle) -> Result<bool> {
        self.state.lock().entry(handle).map(|entry| entry.frozen)
    }

    /// Freeze a pact and return a snapshot plus the previous frozen flag.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn freeze(&self, handle: PactHandle) -> Result<(Pact, bool)> {
        let mut state = self.state.lock();
        let entry = state.entry_mut(handle)?;
        let was_frozen = std::mem::replace(&mut entry.frozen, true);
        Ok((entry.pact.clone(), was_frozen))
    }

    /// Restore the frozen flag after a failed activation.
    pub fn restore_frozen(&self, handle: PactHandle, frozen: bool) {
        if let Ok(entry) = self.state.lock().entry_mut(handle) {
            entry.frozen = frozen;
        }
    }

    /// Append an interaction and issue a handle for it.
    ///
    /// HTTP interactions get interaction handles, messages get message
    /// handles; the raw id is returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen` or `DuplicateDescription`.
    pub(crate) fn add_interaction(&self, handle: PactHandle, interaction: PactInteraction) -> Result<u32> {
        let mut state = self.state.lock();
        let is_http = matches!(interaction, PactInteraction::Http(_));
        let arena_exhausted = if is_http {
            state.interactions.exhausted()
        } else {
            state.messages.exhausted()
        };
        if arena_exhausted {
            return Err(PactError::internal("interaction handles exhausted"));
        }
        let entry = state.mutable_entry(handle)?;
        if entry.pact.description_taken(interaction.description(), None) {
            return Err(PactError::DuplicateDescription(interaction.description().to_string()));
        }
        entry.pact.interactions.push(interaction);
        let reference = InteractionRef {
            pact: handle,
            index: entry.pact.interactions.len() - 1,
        };
        let id = if is_http {
            state.interactions.insert(reference)
        } else {
            state.messages.insert(reference)
        };
        id.ok_or_else(|| PactError::internal("interaction handles exhausted"))
    }

    fn update_entry<R>(
        &self,
        kind: HandleKind,
        id: u32,
        f: impl FnOnce(&mut Pact, usize) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock();
        let reference = state.resolve(kind, id)?;
        let entry = state.mutable_entry(reference.pact)?;
        f(&mut entry.pact, reference.index)
    }

    fn read_entry<R>(&self, kind: HandleKind, id: u32, f: impl FnOnce(&Pact, usize) -> R) -> Result<R> {
        let state = self.state.lock();
        let reference = state.resolve(kind, id)?;
        let entry = state.entry(reference.pact)?;
        Ok(f(&entry.pact, reference.index))
    }

    /// Mutate an HTTP interaction of a pact that is not frozen.
    ///
    /// The closure receives the whole pact and the interaction index so
    /// that pact-wide invariants can be checked.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or the closure's error.
    pub fn update_interaction<R>(
        &self,
        handle: InteractionHandle,
        f: impl FnOnce(&mut Pact, usize) -> Result<R>,
    ) -> Result<R> {
        self.update_entry(HandleKind::Interaction, handle.id(), f)
    }

    /// Read an HTTP interaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn read_interaction<R>(&self, handle: InteractionHandle, f: impl FnOnce(&Pact, usize) -> R) -> Result<R> {
        self.read_entry(HandleKind::Interaction, handle.id(), f)
    }

    /// Mutate a message of a pact that is not frozen.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle`, `Frozen`, or the closure's error.
    pub fn update_message<R>(
        &self,
        handle: MessageHandle,
        f: impl FnOnce(&mut Pact, usize) -> Result<R>,
    ) -> Result<R> {
        self.update_entry(HandleKind::Message, handle.id(), f)
    }

    /// Read a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn read_message<R>(&self, handle: MessageHandle, f: impl FnOnce(&Pact, usize) -> R) -> Result<R> {
        self.read_entry(HandleKind::Message, handle.id(), f)
    }

    /// Pact owning an interaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn interaction_owner(&self, handle: InteractionHandle) -> Result<PactHandle> {
        let state = self.state.lock();
        state.resolve(HandleKind::Interaction, handle.id())
            .map(|r| r.pact)
    }

    /// Pact owning a message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn message_owner(&self, handle: MessageHandle) -> Result<PactHandle> {
        let state = self.state.lock();
        state.resolve(HandleKind::Message, handle.id())
            .map(|r| r.pact)
    }

    /// Register a verifier. Returns the null handle 0 once every verifier
    /// id has been issued.
    pub fn insert_verifier(&self, verifier: Verifier) -> VerifierHandle {
        let id = self.state.lock().verifiers.insert(Arc::new(Mutex::new(verifier)));
        VerifierHandle::new(id.unwrap_or_else(|| {
            warn!("Verifier handles exhausted");
            0
        }))
    }

    /// Shared verifier state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` if the handle does not resolve.
    pub fn verifier(&self, handle: VerifierHandle) -> Result<Arc<Mutex<Verifier>>> {
        self.state
            .lock()
            .verifiers
            .get(handle.id())
            .cloned()
            .ok_or_else(|| handle.invalid())
    }

    /// Remove a verifier; returns `false` when the handle was not live.
    pub fn remove_verifier(&self, handle: VerifierHandle) -> bool {
        self.state.lock().verifiers.remove(handle.id()).is_some()
    }
}
