use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{CloseOutcome, ScheduleStore, StoreError};

/// Reference store: rows in `DashMap`s, optionally journaled to a WAL.
///
/// Every write goes through `journal`'s mutex: precondition check, journal
/// append, then apply. That makes each write, including the transaction
/// close compare-and-set, atomic with respect to every other write.
pub struct InMemoryStore {
    reservations: DashMap<Ulid, Reservation>,
    time_blocks: DashMap<Ulid, TimeBlock>,
    transactions: DashMap<Ulid, Transaction>,
    journal: Mutex<Option<Wal>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Volatile store, nothing journaled.
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
            time_blocks: DashMap::new(),
            transactions: DashMap::new(),
            journal: Mutex::new(None),
        }
    }

    /// Durable store: replay the journal at `path`, drop any torn tail, then
    /// keep appending to it.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let (wal, events) = Wal::recover(path)?;
        let store = Self::new();
        for event in &events {
            store.apply(event);
        }
        info!(
            path = %path.display(),
            events = events.len(),
            reservations = store.reservations.len(),
            time_blocks = store.time_blocks.len(),
            transactions = store.transactions.len(),
            "journal replayed"
        );
        Ok(Self {
            journal: Mutex::new(Some(wal)),
            ..store
        })
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub fn time_block_count(&self) -> usize {
        self.time_blocks.len()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub async fn appends_since_compact(&self) -> u64 {
        self.journal
            .lock()
            .await
            .as_ref()
            .map_or(0, Wal::appends_since_compact)
    }

    /// Rewrite the journal with only the events needed to recreate the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let Some(wal) = journal.as_mut() else {
            return Ok(());
        };
        let events = self.snapshot();
        wal.compact(&events)?;
        info!(events = events.len(), "journal compacted");
        Ok(())
    }

    fn snapshot(&self) -> Vec<Event> {
        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);
        let mut blocks: Vec<TimeBlock> = self.time_blocks.iter().map(|e| e.value().clone()).collect();
        blocks.sort_by_key(|b| b.id);
        let mut transactions: Vec<Transaction> =
            self.transactions.iter().map(|e| e.value().clone()).collect();
        transactions.sort_by_key(|t| t.id);

        reservations
            .into_iter()
            .map(|reservation| Event::ReservationCreated { reservation })
            .chain(blocks.into_iter().map(|block| Event::TimeBlockCreated { block }))
            .chain(
                transactions
                    .into_iter()
                    .map(|transaction| Event::TransactionRecorded { transaction }),
            )
            .collect()
    }

    /// Journal (if durable) then apply. Caller holds the journal lock.
    fn append_and_apply(&self, journal: &mut Option<Wal>, event: Event) -> Result<(), StoreError> {
        if let Some(wal) = journal.as_mut() {
            wal.append(&event)?;
            metrics::counter!(observability::JOURNAL_APPENDS_TOTAL).increment(1);
        }
        self.apply(&event);
        Ok(())
    }

    fn apply(&self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationRescheduled {
                id,
                therapist_id,
                span,
                ..
            } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.therapist_id = *therapist_id;
                    r.span = *span;
                }
            }
            Event::ReservationStatusChanged { id, status, .. } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.status = *status;
                }
            }
            Event::TimeBlockCreated { block } | Event::TimeBlockUpdated { block } => {
                self.time_blocks.insert(block.id, block.clone());
            }
            Event::TimeBlockDeleted { id, .. } => {
                self.time_blocks.remove(id);
            }
            Event::TransactionRecorded { transaction } => {
                self.transactions.insert(transaction.id, transaction.clone());
            }
            Event::TransactionClosed { id } => {
                if let Some(mut t) = self.transactions.get_mut(id) {
                    t.status = TransactionStatus::Closed;
                }
            }
        }
    }

    fn reservation_therapist(&self, id: &Ulid) -> Result<Ulid, StoreError> {
        self.reservations
            .get(id)
            .map(|r| r.therapist_id)
            .ok_or(StoreError::Missing(*id))
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|r| r.value().clone()))
    }

    async fn reservations_for(&self, therapist_id: Ulid) -> Result<Vec<Reservation>, StoreError> {
        let mut rows: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|r| r.therapist_id == therapist_id)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.span.start(), r.id));
        Ok(rows)
    }

    async fn insert_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        if self.reservations.contains_key(&reservation.id) {
            return Err(StoreError::Duplicate(reservation.id));
        }
        self.append_and_apply(
            &mut journal,
            Event::ReservationCreated {
                reservation: reservation.clone(),
            },
        )
    }

    async fn reschedule_reservation(
        &self,
        id: Ulid,
        therapist_id: Ulid,
        span: Span,
    ) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let from_therapist_id = self.reservation_therapist(&id)?;
        self.append_and_apply(
            &mut journal,
            Event::ReservationRescheduled {
                id,
                from_therapist_id,
                therapist_id,
                span,
            },
        )
    }

    async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        let therapist_id = self.reservation_therapist(&id)?;
        self.append_and_apply(
            &mut journal,
            Event::ReservationStatusChanged {
                id,
                therapist_id,
                status,
            },
        )
    }

    async fn time_block(&self, id: Ulid) -> Result<Option<TimeBlock>, StoreError> {
        Ok(self.time_blocks.get(&id).map(|b| b.value().clone()))
    }

    async fn time_blocks_for(&self, therapist_id: Ulid) -> Result<Vec<TimeBlock>, StoreError> {
        let mut rows: Vec<TimeBlock> = self
            .time_blocks
            .iter()
            .filter(|b| b.therapist_id == therapist_id)
            .map(|b| b.value().clone())
            .collect();
        rows.sort_by_key(|b| (b.span.start(), b.id));
        Ok(rows)
    }

    async fn insert_time_block(&self, block: &TimeBlock) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        if self.time_blocks.contains_key(&block.id) {
            return Err(StoreError::Duplicate(block.id));
        }
        self.append_and_apply(
            &mut journal,
            Event::TimeBlockCreated {
                block: block.clone(),
            },
        )
    }

    async fn update_time_block(&self, block: &TimeBlock) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        if !self.time_blocks.contains_key(&block.id) {
            return Err(StoreError::Missing(block.id));
        }
        self.append_and_apply(
            &mut journal,
            Event::TimeBlockUpdated {
                block: block.clone(),
            },
        )
    }

    async fn delete_time_block(&self, id: Ulid) -> Result<Option<TimeBlock>, StoreError> {
        let mut journal = self.journal.lock().await;
        let Some(existing) = self.time_blocks.get(&id).map(|b| b.value().clone()) else {
            return Ok(None);
        };
        self.append_and_apply(
            &mut journal,
            Event::TimeBlockDeleted {
                id,
                therapist_id: existing.therapist_id,
            },
        )?;
        Ok(Some(existing))
    }

    async fn record_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut journal = self.journal.lock().await;
        if self.transactions.contains_key(&transaction.id) {
            return Err(StoreError::Duplicate(transaction.id));
        }
        self.append_and_apply(
            &mut journal,
            Event::TransactionRecorded {
                transaction: transaction.clone(),
            },
        )
    }

    async fn transactions_created_within(&self, span: Span) -> Result<Vec<Transaction>, StoreError> {
        let mut rows: Vec<Transaction> = self
            .transactions
            .iter()
            .filter(|t| span.contains_instant(t.created_at))
            .map(|t| t.value().clone())
            .collect();
        rows.sort_by_key(|t| (t.created_at, t.id));
        Ok(rows)
    }

    async fn close_transaction(&self, id: Ulid) -> Result<CloseOutcome, StoreError> {
        let mut journal = self.journal.lock().await;
        let status = self
            .transactions
            .get(&id)
            .map(|t| t.status)
            .ok_or(StoreError::Missing(id))?;
        match status {
            TransactionStatus::Closed => Ok(CloseOutcome::AlreadyClosed),
            TransactionStatus::Open => {
                self.append_and_apply(&mut journal, Event::TransactionClosed { id })?;
                Ok(CloseOutcome::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(therapist_id: Ulid, start: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            client_id: Ulid::new(),
            service_id: Ulid::new(),
            therapist_id,
            span: Span::starting_at(start, HOUR).unwrap(),
            status: ReservationStatus::Pending,
            notes: None,
            total_price: 4500,
        }
    }

    fn transaction(created_at: Ms) -> Transaction {
        Transaction {
            id: Ulid::new(),
            items: vec![LineItem {
                kind: LineKind::Service,
                item_id: Ulid::new(),
                unit_price: 1000,
                quantity: 1,
            }],
            payment_method: PaymentMethod::Cash,
            status: TransactionStatus::Open,
            created_at,
        }
    }

    #[tokio::test]
    async fn reservations_are_scoped_to_therapist() {
        let store = InMemoryStore::new();
        let a = Ulid::new();
        let b = Ulid::new();
        store.insert_reservation(&reservation(a, 2 * HOUR)).await.unwrap();
        store.insert_reservation(&reservation(a, HOUR)).await.unwrap();
        store.insert_reservation(&reservation(b, HOUR)).await.unwrap();

        let rows = store.reservations_for(a).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].start_time() < rows[1].start_time());
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = InMemoryStore::new();
        let r = reservation(Ulid::new(), 0);
        store.insert_reservation(&r).await.unwrap();
        assert!(matches!(
            store.insert_reservation(&r).await,
            Err(StoreError::Duplicate(id)) if id == r.id
        ));
    }

    #[tokio::test]
    async fn reschedule_moves_therapist_and_span_together() {
        let store = InMemoryStore::new();
        let r = reservation(Ulid::new(), HOUR);
        store.insert_reservation(&r).await.unwrap();

        let b = Ulid::new();
        let span = Span::starting_at(5 * HOUR, HOUR).unwrap();
        store.reschedule_reservation(r.id, b, span).await.unwrap();

        let stored = store.reservation(r.id).await.unwrap().unwrap();
        assert_eq!(stored.therapist_id, b);
        assert_eq!(stored.span, span);
        assert!(store.reservations_for(r.therapist_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_rows_are_errors() {
        let store = InMemoryStore::new();
        let id = Ulid::new();
        assert!(matches!(
            store.set_reservation_status(id, ReservationStatus::Cancelled).await,
            Err(StoreError::Missing(_))
        ));
        assert!(store.delete_time_block(id).await.unwrap().is_none());
        assert!(matches!(store.close_transaction(id).await, Err(StoreError::Missing(_))));
    }

    #[tokio::test]
    async fn close_transaction_is_compare_and_set() {
        let store = InMemoryStore::new();
        let t = transaction(HOUR);
        store.record_transaction(&t).await.unwrap();
        assert_eq!(store.close_transaction(t.id).await.unwrap(), CloseOutcome::Closed);
        assert_eq!(
            store.close_transaction(t.id).await.unwrap(),
            CloseOutcome::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn transactions_filtered_by_half_open_window() {
        let store = InMemoryStore::new();
        for at in [0, HOUR, 2 * HOUR] {
            store.record_transaction(&transaction(at)).await.unwrap();
        }
        let window = Span::new(0, 2 * HOUR).unwrap();
        let rows = store.transactions_created_within(window).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn journal_replay_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.wal");
        let therapist = Ulid::new();
        let r = reservation(therapist, HOUR);
        let block = TimeBlock {
            id: Ulid::new(),
            therapist_id: therapist,
            span: Span::new(3 * HOUR, 4 * HOUR).unwrap(),
            kind: TimeBlockKind::Vacation,
            reason: None,
        };
        let t = transaction(HOUR);

        {
            let store = InMemoryStore::open(&path).unwrap();
            store.insert_reservation(&r).await.unwrap();
            store
                .set_reservation_status(r.id, ReservationStatus::Confirmed)
                .await
                .unwrap();
            store.insert_time_block(&block).await.unwrap();
            store.record_transaction(&t).await.unwrap();
            store.close_transaction(t.id).await.unwrap();
            assert_eq!(store.appends_since_compact().await, 5);
        }

        let reopened = InMemoryStore::open(&path).unwrap();
        let stored = reopened.reservation(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Confirmed);
        assert_eq!(reopened.time_block(block.id).await.unwrap(), Some(block));
        assert_eq!(
            reopened.close_transaction(t.id).await.unwrap(),
            CloseOutcome::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn writes_after_crash_recovery_survive_the_next_restart() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.wal");
        let therapist = Ulid::new();
        let first = reservation(therapist, HOUR);
        let second = reservation(therapist, 3 * HOUR);

        {
            let store = InMemoryStore::open(&path).unwrap();
            store.insert_reservation(&first).await.unwrap();
        }
        // Crash mid-append: a length prefix with only part of its payload.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        {
            let store = InMemoryStore::open(&path).unwrap();
            assert_eq!(store.reservation_count(), 1);
            store.insert_reservation(&second).await.unwrap();
            assert_eq!(store.reservation_count(), 2);
        }

        let reopened = InMemoryStore::open(&path).unwrap();
        assert_eq!(reopened.reservation_count(), 2);
        assert_eq!(reopened.reservation(second.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn compact_keeps_current_state_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compact.wal");
        let therapist = Ulid::new();
        let r = reservation(therapist, HOUR);

        {
            let store = InMemoryStore::open(&path).unwrap();
            store.insert_reservation(&r).await.unwrap();
            for hour in 2..8 {
                let span = Span::starting_at(hour * HOUR, HOUR).unwrap();
                store.reschedule_reservation(r.id, therapist, span).await.unwrap();
            }
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        let reopened = InMemoryStore::open(&path).unwrap();
        let stored = reopened.reservation(r.id).await.unwrap().unwrap();
        assert_eq!(stored.start_time(), 7 * HOUR);
    }
}
