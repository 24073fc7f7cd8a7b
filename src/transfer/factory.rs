//! State Factory
//!
//! Binds a transfer to its current state and runs events against it while
//! the global state lock is held.
//!
//! # Locking
//!
//! One process-wide `tokio::sync::Mutex<()>` serializes every state read,
//! transition and persistence. Acquisition waits at most
//! `transfer.lock_timeout_ms`; a timeout is logged at error level and
//! returned as [`TransferError::LockTimeout`], never retried.
//!
//! The lock is not re-entrant. A [`TransferScope`] owns the guard for its
//! whole life and transitions only see a [`Transition`], which has no path
//! back to the factory, so nested acquisition cannot be written.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::lock::TransferLock;
use super::machine::{self, Transition};
use super::notifier::Notifier;
use super::persistor::StatePersistor;
use super::state::{TransferEvent, TransferStatus};
use super::types::{Transfer, TransferId};
use crate::config::TransferConfig;
use crate::switch::SwitchClient;

pub struct StateFactory {
    state_lock: Arc<Mutex<()>>,
    lock_timeout: Duration,
    persistor: StatePersistor,
    switch: Arc<dyn SwitchClient>,
    notifier: Notifier,
    transfer_lock: Arc<TransferLock>,
    config: TransferConfig,
}

impl StateFactory {
    pub fn new(
        switch: Arc<dyn SwitchClient>,
        persistor: StatePersistor,
        notifier: Notifier,
        transfer_lock: Arc<TransferLock>,
        config: TransferConfig,
    ) -> Self {
        Self {
            state_lock: Arc::new(Mutex::new(())),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            persistor,
            switch,
            notifier,
            transfer_lock,
            config,
        }
    }

    pub fn transfer_lock(&self) -> &TransferLock {
        &self.transfer_lock
    }

    pub fn switch(&self) -> &Arc<dyn SwitchClient> {
        &self.switch
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    async fn lock(&self) -> Result<OwnedMutexGuard<()>, TransferError> {
        match tokio::time::timeout(self.lock_timeout, self.state_lock.clone().lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                error!(
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "Transfer state lock not acquired in time"
                );
                Err(TransferError::LockTimeout(self.lock_timeout))
            }
        }
    }

    /// Bind the persisted transfer `id` to its stored state
    pub async fn make(&self, id: &TransferId) -> Result<TransferScope<'_>, TransferError> {
        let guard = self.lock().await?;
        let transfer = self.persistor.get(id).await?;
        Ok(TransferScope::new(self, guard, transfer))
    }

    /// Bind the persisted transfer owning `channel_id`
    pub async fn make_by_channel(&self, channel_id: &str) -> Result<TransferScope<'_>, TransferError> {
        let guard = self.lock().await?;
        let transfer = self.persistor.get_by_channel(channel_id).await?;
        Ok(TransferScope::new(self, guard, transfer))
    }

    /// Bind an in-memory transfer to an explicitly chosen state
    pub async fn make_from_class(
        &self,
        status: TransferStatus,
        mut transfer: Transfer,
    ) -> Result<TransferScope<'_>, TransferError> {
        let guard = self.lock().await?;
        transfer.status = status;
        Ok(TransferScope::new(self, guard, transfer))
    }

    pub async fn get(&self, id: &TransferId) -> Result<Transfer, TransferError> {
        let _guard = self.lock().await?;
        self.persistor.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Transfer>, TransferError> {
        let _guard = self.lock().await?;
        self.persistor.list().await
    }

    /// Take the transfer lock of every persisted initiator
    ///
    /// The locks live in memory only; after a restart they are rebuilt from
    /// the store before any new transfer is accepted.
    pub async fn restore_locks(&self) -> Result<usize, TransferError> {
        let transfers = self.list().await?;
        let mut restored = 0;
        for transfer in &transfers {
            if self.transfer_lock.acquire(&transfer.initiator_call) {
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "Transfer locks restored from store");
        }
        Ok(restored)
    }

    /// Run one event against a persisted transfer and persist the outcome
    pub async fn transition(
        &self,
        id: &TransferId,
        event: TransferEvent,
    ) -> Result<Transfer, TransferError> {
        let mut scope = self.make(id).await?;
        scope.apply(event).await?;
        scope.finish().await
    }
}

/// A transfer bound to its state, holding the global state lock
///
/// Dropping a scope without [`finish`](Self::finish) leaves the persisted
/// record untouched.
pub struct TransferScope<'f> {
    factory: &'f StateFactory,
    guard: OwnedMutexGuard<()>,
    transfer: Transfer,
    initial: TransferStatus,
}

impl<'f> TransferScope<'f> {
    fn new(factory: &'f StateFactory, guard: OwnedMutexGuard<()>, transfer: Transfer) -> Self {
        let initial = transfer.status;
        Self {
            factory,
            guard,
            transfer,
            initial,
        }
    }

    pub fn transfer(&self) -> &Transfer {
        &self.transfer
    }

    pub fn status(&self) -> TransferStatus {
        self.transfer.status
    }

    /// Apply one event
    ///
    /// Refusals leave everything as it was. Any other failure also gives the
    /// initiator's transfer lock back before propagating.
    pub async fn apply(&mut self, event: TransferEvent) -> Result<TransferStatus, TransferError> {
        let old = self.transfer.status;
        let name = event.name();

        let mut cx = Transition {
            transfer: &mut self.transfer,
            switch: self.factory.switch.as_ref(),
            notifier: &self.factory.notifier,
            config: &self.factory.config,
            _state_lock: &self.guard,
        };
        let result = machine::dispatch(&mut cx, event).await;

        match result {
            Ok(new) => {
                self.transfer.status = new;
                info!(transfer_id = %self.transfer.id, "{} -[{}]-> {}", old, name, new);
                Ok(new)
            }
            Err(e) if e.is_refusal() => {
                debug!(transfer_id = %self.transfer.id, error = %e, "Transition refused");
                Err(e)
            }
            Err(e) => {
                warn!(
                    transfer_id = %self.transfer.id,
                    state = %old,
                    event = name,
                    error = %e,
                    "Transition failed"
                );
                self.factory
                    .transfer_lock
                    .release(&self.transfer.initiator_call);
                Err(e)
            }
        }
    }

    /// Persist the outcome and release the state lock
    ///
    /// Reaching `ended` removes the record, frees the initiator and
    /// publishes `ended`, once.
    pub async fn finish(self) -> Result<Transfer, TransferError> {
        let TransferScope {
            factory,
            guard,
            transfer,
            initial,
        } = self;

        let stored = if transfer.status.is_terminal() {
            // The calls are settled whatever the store says
            factory.transfer_lock.release(&transfer.initiator_call);
            let removed = factory.persistor.remove(&transfer.id).await;
            if !initial.is_terminal() {
                factory.notifier.ended(&transfer).await;
            }
            removed
        } else if transfer.status == TransferStatus::New {
            Ok(())
        } else {
            factory.persistor.upsert(&transfer).await
        };

        drop(guard);
        if let Err(e) = stored {
            error!(
                transfer_id = %transfer.id,
                status = %transfer.status,
                error = %e,
                "Transfer state not stored"
            );
            factory.transfer_lock.release(&transfer.initiator_call);
            return Err(e);
        }
        Ok(transfer)
    }
}
