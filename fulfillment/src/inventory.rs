//! Inventory ledger.
//!
//! One record per (product, variant, warehouse) with `available` and
//! `reserved` counters. Each record is its own single-writer store, so every
//! operation on a key is linearizable while different keys never contend.
//! Every accepted change is written to the journal as an
//! [`InventoryTransaction`] before the counters move; the journal is the audit
//! trail and the basis for [`InventoryLedger::verify`].
//!
//! **Invariant**: `reserved ≤ available` for every record, at all times.

use crate::metrics;
use crate::types::{InventoryKey, OrderId, ProductId, ReservationId, TransactionId, VariantId, WarehouseId};
use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;
use fulfillment_core::journal::{Journal, JournalError};
use fulfillment_core::reducer::{Events, Reducer};
use fulfillment_core::smallvec;
use fulfillment_core::stream::StreamId;
use fulfillment_runtime::{InMemoryJournal, KeyedStore, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const KIND: &str = "inventory";

// ============================================================================
// Errors
// ============================================================================

/// Inventory ledger errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Not enough free stock. `warehouse_id` is `None` when the shortfall is
    /// across every candidate warehouse of a line.
    #[error("insufficient stock for {product_id}/{variant_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product
        product_id: ProductId,
        /// Variant
        variant_id: VariantId,
        /// Warehouse that ran short, if a single one was asked
        warehouse_id: Option<WarehouseId>,
        /// Units asked for
        requested: u32,
        /// Units free at the time of the request
        available: u32,
    },

    /// Quantities and deltas must be non-zero
    #[error("quantity must be positive")]
    InvalidQuantity,

    /// The reservation was never made against this record
    #[error("unknown reservation: {0}")]
    UnknownReservation(ReservationId),

    /// Commit after release, or release after commit
    #[error("reservation {reservation_id} is already {state}")]
    AlreadySettled {
        /// Reservation
        reservation_id: ReservationId,
        /// Its final state
        state: ReservationState,
    },

    /// A negative adjustment would push `available` below `reserved`
    #[error("adjusting {key} by {delta} would leave available below reserved ({levels})")]
    AdjustmentBelowReserved {
        /// Record
        key: InventoryKey,
        /// Requested change
        delta: i64,
        /// Counters before the change
        levels: StockLevels,
    },

    /// A positive adjustment overflowed the counter
    #[error("adjusting {key} by {delta} overflows the stock counter")]
    Overflow {
        /// Record
        key: InventoryKey,
        /// Requested change
        delta: i64,
    },

    /// Replaying the journal does not reproduce the live counters
    #[error("replay of {key} diverged: live {live}, replayed {replayed}")]
    ReplayMismatch {
        /// Record
        key: InventoryKey,
        /// Counters held in memory
        live: StockLevels,
        /// Counters rebuilt from the journal
        replayed: StockLevels,
    },

    /// The journal rejected the write
    #[error(transparent)]
    Journal(#[from] JournalError),
}

// ============================================================================
// State
// ============================================================================

/// The two counters of an inventory record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    /// Units physically on hand
    pub available: u32,
    /// Units claimed by reservations that are not yet committed
    pub reserved: u32,
}

impl StockLevels {
    /// Units that can still be reserved
    #[must_use]
    pub const fn free(&self) -> u32 {
        self.available.saturating_sub(self.reserved)
    }
}

impl fmt::Display for StockLevels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "available={} reserved={}", self.available, self.reserved)
    }
}

/// Lifecycle of a single reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Counted in `reserved`
    Held,
    /// Converted into a stock deduction
    Committed,
    /// Returned to free stock
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Held => "held",
            Self::Committed => "committed",
            Self::Released => "released",
        })
    }
}

/// What a record remembers about each reservation made against it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEntry {
    /// Order holding the claim
    pub order_id: OrderId,
    /// Units claimed
    pub quantity: u32,
    /// Current state
    pub state: ReservationState,
}

/// One (product, variant, warehouse) record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Record identity
    pub key: InventoryKey,
    /// Counters
    pub levels: StockLevels,
    /// Every reservation ever made here
    pub reservations: HashMap<ReservationId, ReservationEntry>,
}

impl InventoryRecord {
    /// A record with no stock. Records are never deleted, only zeroed.
    #[must_use]
    pub fn empty(key: InventoryKey) -> Self {
        Self {
            key,
            levels: StockLevels::default(),
            reservations: HashMap::new(),
        }
    }
}

/// Claim on stock handed back to the caller of `reserve`.
///
/// Pass it to [`InventoryLedger::commit`] or [`InventoryLedger::release`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identity
    pub id: ReservationId,
    /// Record the stock was claimed from
    pub key: InventoryKey,
    /// Units claimed
    pub quantity: u32,
    /// Order the claim belongs to
    pub order_id: OrderId,
}

// ============================================================================
// Transactions (events)
// ============================================================================

/// Why stock was adjusted by hand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "order_id", rename_all = "snake_case")]
pub enum AdjustmentReason {
    /// Goods received from a supplier
    Receiving,
    /// Damaged or lost stock written off
    Damage,
    /// Stock-take correction
    Correction,
    /// Committed stock returned to the shelf when a paid order was cancelled
    CancellationRestock(OrderId),
}

/// What triggered a ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "order_id", rename_all = "snake_case")]
pub enum TransactionSource {
    /// A checkout, payment outcome, or cancellation of this order
    Order(OrderId),
    /// An operator adjustment
    ManualAdjustment,
}

/// The kind of change a ledger entry records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    /// `reserved += quantity`
    Reserve {
        /// Reservation created
        reservation_id: ReservationId,
        /// Units claimed
        quantity: u32,
    },
    /// `reserved -= quantity`
    Release {
        /// Reservation released
        reservation_id: ReservationId,
        /// Units returned
        quantity: u32,
    },
    /// `available -= quantity; reserved -= quantity`
    Commit {
        /// Reservation committed
        reservation_id: ReservationId,
        /// Units deducted
        quantity: u32,
    },
    /// `available += delta`
    Adjust {
        /// Signed change
        delta: i64,
        /// Why
        reason: AdjustmentReason,
    },
}

/// Immutable ledger entry with before/after counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    /// Entry identity
    pub id: TransactionId,
    /// Record changed
    pub key: InventoryKey,
    /// Change
    pub kind: TransactionKind,
    /// Trigger
    pub source: TransactionSource,
    /// Counters before
    pub before: StockLevels,
    /// Counters after
    pub after: StockLevels,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// Reducer
// ============================================================================

/// How much of a request must be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReserveMode {
    /// All of it, or fail with `InsufficientStock`
    Exact,
    /// As much as is free, possibly nothing
    UpTo,
}

/// Commands accepted by an inventory record.
#[derive(Clone, Debug)]
pub enum InventoryCommand {
    /// Claim stock for an order
    Reserve {
        /// Caller-chosen id, so a retried command is recognised
        reservation_id: ReservationId,
        /// Claiming order
        order_id: OrderId,
        /// Units wanted
        quantity: u32,
        /// Exact or best-effort
        mode: ReserveMode,
    },
    /// Convert a held reservation into a deduction
    Commit {
        /// Reservation
        reservation_id: ReservationId,
    },
    /// Return a held reservation to free stock
    Release {
        /// Reservation
        reservation_id: ReservationId,
    },
    /// Manual correction of `available`
    Adjust {
        /// Signed change
        delta: i64,
        /// Why
        reason: AdjustmentReason,
    },
}

/// Injected dependencies.
#[derive(Clone)]
pub struct InventoryEnvironment {
    /// Timestamps for ledger entries
    pub clock: Arc<dyn Clock>,
}

/// Reducer for a single inventory record.
#[derive(Clone, Copy, Debug, Default)]
pub struct InventoryReducer;

impl InventoryReducer {
    fn entry(
        record: &InventoryRecord,
        kind: TransactionKind,
        source: TransactionSource,
        after: StockLevels,
        env: &InventoryEnvironment,
    ) -> InventoryTransaction {
        InventoryTransaction {
            id: TransactionId::new(),
            key: record.key.clone(),
            kind,
            source,
            before: record.levels,
            after,
            recorded_at: env.clock.now(),
        }
    }

    fn held(record: &InventoryRecord, reservation_id: ReservationId) -> Result<Option<&ReservationEntry>, LedgerError> {
        let entry = record
            .reservations
            .get(&reservation_id)
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        Ok((entry.state == ReservationState::Held).then_some(entry))
    }

    fn reduce_reserve(
        record: &InventoryRecord,
        reservation_id: ReservationId,
        order_id: OrderId,
        quantity: u32,
        mode: ReserveMode,
        env: &InventoryEnvironment,
    ) -> Result<Events<InventoryTransaction>, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        if record.reservations.contains_key(&reservation_id) {
            return Ok(Events::new());
        }

        let free = record.levels.free();
        let granted = match mode {
            ReserveMode::Exact if quantity > free => {
                return Err(LedgerError::InsufficientStock {
                    product_id: record.key.product_id.clone(),
                    variant_id: record.key.variant_id.clone(),
                    warehouse_id: Some(record.key.warehouse_id.clone()),
                    requested: quantity,
                    available: free,
                });
            },
            ReserveMode::Exact => quantity,
            ReserveMode::UpTo => quantity.min(free),
        };
        if granted == 0 {
            return Ok(Events::new());
        }

        let after = StockLevels {
            available: record.levels.available,
            reserved: record.levels.reserved + granted,
        };
        Ok(smallvec![Self::entry(
            record,
            TransactionKind::Reserve {
                reservation_id,
                quantity: granted,
            },
            TransactionSource::Order(order_id),
            after,
            env,
        )])
    }

    fn reduce_settle(
        record: &InventoryRecord,
        reservation_id: ReservationId,
        target: ReservationState,
        env: &InventoryEnvironment,
    ) -> Result<Events<InventoryTransaction>, LedgerError> {
        let Some(entry) = Self::held(record, reservation_id)? else {
            // Settling twice the same way is a no-op; the opposite way is not.
            let state = record
                .reservations
                .get(&reservation_id)
                .map_or(target, |entry| entry.state);
            if state == target {
                return Ok(Events::new());
            }
            return Err(LedgerError::AlreadySettled { reservation_id, state });
        };

        let quantity = entry.quantity;
        let (kind, after) = if target == ReservationState::Committed {
            (
                TransactionKind::Commit {
                    reservation_id,
                    quantity,
                },
                StockLevels {
                    available: record.levels.available - quantity,
                    reserved: record.levels.reserved - quantity,
                },
            )
        } else {
            (
                TransactionKind::Release {
                    reservation_id,
                    quantity,
                },
                StockLevels {
                    available: record.levels.available,
                    reserved: record.levels.reserved - quantity,
                },
            )
        };
        Ok(smallvec![Self::entry(
            record,
            kind,
            TransactionSource::Order(entry.order_id),
            after,
            env
        )])
    }

    fn reduce_adjust(
        record: &InventoryRecord,
        delta: i64,
        reason: AdjustmentReason,
        env: &InventoryEnvironment,
    ) -> Result<Events<InventoryTransaction>, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        let resulting = i64::from(record.levels.available) + delta;
        if resulting < i64::from(record.levels.reserved) {
            return Err(LedgerError::AdjustmentBelowReserved {
                key: record.key.clone(),
                delta,
                levels: record.levels,
            });
        }
        let available = u32::try_from(resulting).map_err(|_| LedgerError::Overflow {
            key: record.key.clone(),
            delta,
        })?;

        let source = match &reason {
            AdjustmentReason::CancellationRestock(order_id) => TransactionSource::Order(*order_id),
            _ => TransactionSource::ManualAdjustment,
        };
        let after = StockLevels {
            available,
            reserved: record.levels.reserved,
        };
        Ok(smallvec![Self::entry(
            record,
            TransactionKind::Adjust { delta, reason },
            source,
            after,
            env
        )])
    }
}

impl Reducer for InventoryReducer {
    type State = InventoryRecord;
    type Command = InventoryCommand;
    type Event = InventoryTransaction;
    type Error = LedgerError;
    type Environment = InventoryEnvironment;

    fn reduce(
        &self,
        record: &InventoryRecord,
        command: InventoryCommand,
        env: &InventoryEnvironment,
    ) -> Result<Events<InventoryTransaction>, LedgerError> {
        match command {
            InventoryCommand::Reserve {
                reservation_id,
                order_id,
                quantity,
                mode,
            } => Self::reduce_reserve(record, reservation_id, order_id, quantity, mode, env),
            InventoryCommand::Commit { reservation_id } => {
                Self::reduce_settle(record, reservation_id, ReservationState::Committed, env)
            },
            InventoryCommand::Release { reservation_id } => {
                Self::reduce_settle(record, reservation_id, ReservationState::Released, env)
            },
            InventoryCommand::Adjust { delta, reason } => Self::reduce_adjust(record, delta, reason, env),
        }
    }

    fn apply(&self, record: &mut InventoryRecord, transaction: &InventoryTransaction) {
        record.levels = transaction.after;
        match &transaction.kind {
            TransactionKind::Reserve {
                reservation_id,
                quantity,
            } => {
                let order_id = match transaction.source {
                    TransactionSource::Order(order_id) => order_id,
                    TransactionSource::ManualAdjustment => OrderId::default(),
                };
                record.reservations.insert(
                    *reservation_id,
                    ReservationEntry {
                        order_id,
                        quantity: *quantity,
                        state: ReservationState::Held,
                    },
                );
            },
            TransactionKind::Commit { reservation_id, .. } => {
                if let Some(entry) = record.reservations.get_mut(reservation_id) {
                    entry.state = ReservationState::Committed;
                }
            },
            TransactionKind::Release { reservation_id, .. } => {
                if let Some(entry) = record.reservations.get_mut(reservation_id) {
                    entry.state = ReservationState::Released;
                }
            },
            TransactionKind::Adjust { .. } => {},
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Per-key inventory counters with an append-only transaction log.
pub struct InventoryLedger {
    records: KeyedStore<InventoryKey, InventoryReducer>,
    journal: Arc<InMemoryJournal<InventoryTransaction>>,
}

impl InventoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let journal = Arc::new(InMemoryJournal::new());
        let shared: Arc<dyn Journal<InventoryTransaction>> = journal.clone();
        let records = KeyedStore::new(KIND, InventoryReducer, InventoryEnvironment { clock }).with_journal(shared);
        Self { records, journal }
    }

    async fn store(&self, key: &InventoryKey) -> Arc<Store<InventoryReducer>> {
        self.records
            .get_or_create(key, || InventoryRecord::empty(key.clone()))
            .await
    }

    /// Claim `quantity` units for `order_id`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientStock`] when `available − reserved < quantity`;
    /// nothing changes in that case.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    pub async fn reserve(&self, key: &InventoryKey, quantity: u32, order_id: OrderId) -> Result<Reservation, LedgerError> {
        let id = ReservationId::new();
        let result = self
            .store(key)
            .await
            .send(InventoryCommand::Reserve {
                reservation_id: id,
                order_id,
                quantity,
                mode: ReserveMode::Exact,
            })
            .await;

        match result {
            Ok(_) => {
                metrics::record_reservation("reserved");
                tracing::debug!(reservation_id = %id, "Stock reserved");
                Ok(Reservation {
                    id,
                    key: key.clone(),
                    quantity,
                    order_id,
                })
            },
            Err(error) => {
                metrics::record_reservation("insufficient");
                Err(error)
            },
        }
    }

    /// Claim `min(max_quantity, free)` units. Returns `None` when nothing is
    /// free.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidQuantity`] for zero, or a journal failure.
    pub async fn reserve_up_to(
        &self,
        key: &InventoryKey,
        max_quantity: u32,
        order_id: OrderId,
    ) -> Result<Option<Reservation>, LedgerError> {
        let id = ReservationId::new();
        let events = self
            .store(key)
            .await
            .send(InventoryCommand::Reserve {
                reservation_id: id,
                order_id,
                quantity: max_quantity,
                mode: ReserveMode::UpTo,
            })
            .await?;

        Ok(events.iter().find_map(|transaction| match transaction.kind {
            TransactionKind::Reserve { quantity, .. } => {
                metrics::record_reservation("reserved");
                Some(Reservation {
                    id,
                    key: key.clone(),
                    quantity,
                    order_id,
                })
            },
            _ => None,
        }))
    }

    /// Reserve one order line following the warehouse preference order.
    ///
    /// A single warehouse that covers the whole line wins. Otherwise partial
    /// reservations are aggregated in preference order. If the candidates
    /// together cannot cover the line, every partial reservation taken here is
    /// released before returning [`LedgerError::InsufficientStock`].
    ///
    /// # Errors
    ///
    /// [`LedgerError::InsufficientStock`] (with `warehouse_id: None`) when the
    /// line cannot be covered, or any other ledger failure.
    #[tracing::instrument(skip(self, preferences), fields(warehouses = preferences.len()))]
    pub async fn reserve_line(
        &self,
        product_id: &ProductId,
        variant_id: &VariantId,
        quantity: u32,
        preferences: &[WarehouseId],
        order_id: OrderId,
    ) -> Result<Vec<Reservation>, LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity);
        }
        let mut candidates: Vec<InventoryKey> = Vec::with_capacity(preferences.len());
        for warehouse_id in preferences {
            let key = InventoryKey::new(product_id.clone(), variant_id.clone(), warehouse_id.clone());
            if !candidates.contains(&key) {
                candidates.push(key);
            }
        }

        for key in &candidates {
            match self.reserve(key, quantity, order_id).await {
                Ok(reservation) => return Ok(vec![reservation]),
                Err(LedgerError::InsufficientStock { .. }) => {},
                Err(error) => return Err(error),
            }
        }

        let mut taken = Vec::new();
        let mut remaining = quantity;
        for key in &candidates {
            if remaining == 0 {
                break;
            }
            match self.reserve_up_to(key, remaining, order_id).await {
                Ok(Some(reservation)) => {
                    remaining -= reservation.quantity;
                    taken.push(reservation);
                },
                Ok(None) => {},
                Err(error) => {
                    self.release_all(&taken).await;
                    return Err(error);
                },
            }
        }
        if remaining == 0 {
            tracing::info!(parts = taken.len(), "Line reserved across warehouses");
            return Ok(taken);
        }

        self.release_all(&taken).await;
        let mut available = 0u32;
        for key in &candidates {
            available = available.saturating_add(self.free(key).await);
        }
        tracing::warn!(requested = quantity, available, "Line could not be covered by any warehouse combination");
        Err(LedgerError::InsufficientStock {
            product_id: product_id.clone(),
            variant_id: variant_id.clone(),
            warehouse_id: None,
            requested: quantity,
            available,
        })
    }

    /// Release every reservation in `reservations`, logging failures.
    ///
    /// Used for compensation, where the original error is what the caller
    /// needs to see.
    pub async fn release_all(&self, reservations: &[Reservation]) {
        for reservation in reservations {
            if let Err(error) = self.release(reservation).await {
                tracing::error!(reservation_id = %reservation.id, %error, "Compensating release failed");
            }
        }
    }

    /// Deduct a held reservation from stock. Committing twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownReservation`], or
    /// [`LedgerError::AlreadySettled`] if it was released.
    pub async fn commit(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        self.settle(reservation, InventoryCommand::Commit {
            reservation_id: reservation.id,
        })
        .await?;
        metrics::record_reservation("committed");
        Ok(())
    }

    /// Return a held reservation to free stock. Releasing twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`LedgerError::UnknownReservation`], or
    /// [`LedgerError::AlreadySettled`] if it was committed.
    pub async fn release(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        self.settle(reservation, InventoryCommand::Release {
            reservation_id: reservation.id,
        })
        .await?;
        metrics::record_reservation("released");
        Ok(())
    }

    async fn settle(&self, reservation: &Reservation, command: InventoryCommand) -> Result<(), LedgerError> {
        let store = self
            .records
            .get(&reservation.key)
            .await
            .ok_or(LedgerError::UnknownReservation(reservation.id))?;
        store.send(command).await?;
        Ok(())
    }

    /// Manually change `available`. `reserved` is untouched.
    ///
    /// # Errors
    ///
    /// [`LedgerError::AdjustmentBelowReserved`] when a write-off would leave
    /// fewer units than are reserved.
    #[tracing::instrument(skip(self, key), fields(key = %key))]
    pub async fn adjust(&self, key: &InventoryKey, delta: i64, reason: AdjustmentReason) -> Result<StockLevels, LedgerError> {
        let events = self
            .store(key)
            .await
            .send(InventoryCommand::Adjust {
                delta,
                reason: reason.clone(),
            })
            .await?;
        metrics::record_stock_adjustment(&reason);
        let levels = events.last().map(|transaction| transaction.after).unwrap_or_default();
        tracing::info!(%levels, "Stock adjusted");
        Ok(levels)
    }

    /// Goods received: `adjust(+quantity, Receiving)`.
    ///
    /// # Errors
    ///
    /// See [`InventoryLedger::adjust`].
    pub async fn receive(&self, key: &InventoryKey, quantity: u32) -> Result<StockLevels, LedgerError> {
        self.adjust(key, i64::from(quantity), AdjustmentReason::Receiving).await
    }

    /// Snapshot of a record. Unknown keys are reported as empty.
    pub async fn record(&self, key: &InventoryKey) -> InventoryRecord {
        match self.records.get(key).await {
            Some(store) => store.state(InventoryRecord::clone).await,
            None => InventoryRecord::empty(key.clone()),
        }
    }

    /// Current counters for a key.
    pub async fn levels(&self, key: &InventoryKey) -> StockLevels {
        match self.records.get(key).await {
            Some(store) => store.state(|record| record.levels).await,
            None => StockLevels::default(),
        }
    }

    /// Units that can still be reserved at a key.
    pub async fn free(&self, key: &InventoryKey) -> u32 {
        self.levels(key).await.free()
    }

    /// Ledger entries for one record, oldest first.
    ///
    /// # Errors
    ///
    /// Journal failures.
    pub async fn transactions(&self, key: &InventoryKey) -> Result<Vec<InventoryTransaction>, LedgerError> {
        Ok(self.journal.load(StreamId::for_key(KIND, key)).await?)
    }

    /// Every ledger entry across all records, in the order they were written.
    ///
    /// # Errors
    ///
    /// Journal failures.
    pub fn audit_log(&self) -> Result<Vec<InventoryTransaction>, LedgerError> {
        Ok(self
            .journal
            .all()?
            .into_iter()
            .map(|(_, transaction)| transaction)
            .collect())
    }

    /// Rebuild a record from its journal and compare with the live counters.
    ///
    /// # Errors
    ///
    /// [`LedgerError::ReplayMismatch`] when they differ.
    pub async fn verify(&self, key: &InventoryKey) -> Result<StockLevels, LedgerError> {
        let Some(store) = self.records.get(key).await else {
            return Ok(StockLevels::default());
        };
        let (live, replayed) = store
            .compare_with_replay(InventoryRecord::empty(key.clone()), |live, replayed| {
                (live.levels, replayed.levels)
            })
            .await?;
        if live == replayed {
            Ok(live)
        } else {
            tracing::error!(%key, %live, %replayed, "Inventory replay diverged from live counters");
            Err(LedgerError::ReplayMismatch {
                key: key.clone(),
                live,
                replayed,
            })
        }
    }

    /// Every key the ledger has seen.
    pub async fn keys(&self) -> Vec<InventoryKey> {
        self.records
            .entries()
            .await
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }
}
