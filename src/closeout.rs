//! Daily closeout: finalize one local calendar day of point-of-sale
//! transactions and report what was taken.
//!
//! Idempotent by construction. Only `open` transactions qualify and each one
//! is closed with an atomic open → closed transition, so a repeat run (or a
//! concurrent one) finds nothing left to count.

use chrono::{NaiveDate, NaiveTime, TimeDelta, TimeZone};
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::{EngineError, PartialCloseoutError, Scheduler, ValidationError, observe};
use crate::limits::{MAX_LINE_ITEMS_PER_TRANSACTION, MAX_TRANSACTION_TOTAL};
use crate::model::*;
use crate::observability;
use crate::store::{CloseOutcome, ScheduleStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseoutSummary {
    pub date: NaiveDate,
    /// Minor currency units.
    pub total_revenue: i64,
    pub closed_count: usize,
    pub cash_total: i64,
    pub card_total: i64,
    pub closed_ids: Vec<Ulid>,
}

impl CloseoutSummary {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_revenue: 0,
            closed_count: 0,
            cash_total: 0,
            card_total: 0,
            closed_ids: Vec::new(),
        }
    }

    fn tally(&mut self, transaction: &Transaction, amount: i64) -> Result<(), EngineError> {
        self.total_revenue = self
            .total_revenue
            .checked_add(amount)
            .ok_or_else(revenue_overflow)?;
        let bucket = match transaction.payment_method {
            PaymentMethod::Cash => &mut self.cash_total,
            PaymentMethod::Card => &mut self.card_total,
        };
        *bucket = bucket.checked_add(amount).ok_or_else(revenue_overflow)?;
        self.closed_count += 1;
        self.closed_ids.push(transaction.id);
        Ok(())
    }
}

fn revenue_overflow() -> EngineError {
    EngineError::LimitExceeded("closeout revenue overflows")
}

/// Each transaction's total, plus their sum. The batch is refused when any
/// total or the sum of magnitudes leaves `i64`, so every partial tally of it
/// fits too.
fn batch_totals<'a>(
    transactions: impl IntoIterator<Item = &'a Transaction>,
) -> Result<(Vec<i64>, i64), EngineError> {
    let mut amounts = Vec::new();
    let mut magnitude = 0i64;
    let mut sum = 0i64;
    for transaction in transactions {
        let amount = transaction.total().ok_or_else(revenue_overflow)?;
        magnitude = amount
            .checked_abs()
            .and_then(|a| magnitude.checked_add(a))
            .ok_or_else(revenue_overflow)?;
        sum = sum.checked_add(amount).ok_or_else(revenue_overflow)?;
        amounts.push(amount);
    }
    Ok((amounts, sum))
}

/// `[local midnight of date, local midnight of the next day)` as UTC millis.
pub fn day_bounds<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Result<Span, EngineError> {
    let next = date
        .succ_opt()
        .ok_or(EngineError::LimitExceeded("date out of range"))?;
    let start = local_midnight(date, tz)?;
    let end = local_midnight(next, tz)?;
    Ok(Span::new(start, end)?)
}

/// Ambiguous midnights resolve to the earlier instant. A DST gap can swallow
/// midnight; the day then starts at the first local time that exists.
fn local_midnight<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Result<Ms, EngineError> {
    let midnight = date.and_time(NaiveTime::MIN);
    for step in 0..=16 {
        let local = midnight + TimeDelta::minutes(15 * step);
        if let Some(instant) = tz.from_local_datetime(&local).earliest() {
            return Ok(instant.timestamp_millis());
        }
    }
    Err(EngineError::LimitExceeded("local midnight does not exist"))
}

fn qualifies(transaction: &Transaction, day: &Span) -> bool {
    transaction.is_open() && day.contains_instant(transaction.created_at)
}

/// Close every open transaction created on `date` (salon-local) in place.
pub fn closeout<Tz: TimeZone>(
    date: NaiveDate,
    tz: &Tz,
    transactions: &mut [Transaction],
) -> Result<CloseoutSummary, EngineError> {
    let day = day_bounds(date, tz)?;
    let picked: Vec<usize> = transactions
        .iter()
        .enumerate()
        .filter(|(_, t)| qualifies(t, &day))
        .map(|(i, _)| i)
        .collect();
    let view: &[Transaction] = transactions;
    let (amounts, _) = batch_totals(picked.iter().map(|&i| &view[i]))?;

    let mut summary = CloseoutSummary::empty(date);
    for (i, amount) in picked.into_iter().zip(amounts) {
        transactions[i].status = TransactionStatus::Closed;
        summary.tally(&transactions[i], amount)?;
    }
    Ok(summary)
}

/// Close `date` against a store. Revenue is only counted for transactions
/// this call actually transitioned. If any close fails, the result is a
/// [`PartialCloseoutError`] carrying the computed total, what did close, and
/// the ids still open.
pub async fn run_closeout<Tz: TimeZone>(
    store: &dyn ScheduleStore,
    date: NaiveDate,
    tz: &Tz,
) -> Result<CloseoutSummary, EngineError> {
    let day = day_bounds(date, tz)?;
    let candidates: Vec<Transaction> = store
        .transactions_created_within(day)
        .await?
        .into_iter()
        .filter(|t| qualifies(t, &day))
        .collect();
    let (amounts, computed_total) = batch_totals(&candidates)?;

    let mut summary = CloseoutSummary::empty(date);
    let mut still_open = Vec::new();
    let mut cause: Option<String> = None;

    for (transaction, &amount) in candidates.iter().zip(&amounts) {
        match store.close_transaction(transaction.id).await {
            Ok(CloseOutcome::Closed) => {
                summary.tally(transaction, amount)?;
                metrics::counter!(observability::CLOSEOUT_TRANSACTIONS_TOTAL, "outcome" => "closed")
                    .increment(1);
            }
            Ok(CloseOutcome::AlreadyClosed) => {
                debug!(transaction_id = %transaction.id, "closed concurrently, not counted");
                metrics::counter!(observability::CLOSEOUT_TRANSACTIONS_TOTAL, "outcome" => "already_closed")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(observability::CLOSEOUT_TRANSACTIONS_TOTAL, "outcome" => "failed")
                    .increment(1);
                still_open.push(transaction.id);
                cause.get_or_insert_with(|| e.to_string());
            }
        }
    }

    metrics::counter!(observability::CLOSEOUT_REVENUE_MINOR_TOTAL)
        .increment(u64::try_from(summary.total_revenue).unwrap_or(0));

    if !still_open.is_empty() {
        warn!(
            %date,
            computed_total,
            closed_total = summary.total_revenue,
            still_open = still_open.len(),
            "closeout incomplete"
        );
        return Err(PartialCloseoutError {
            date,
            computed_total,
            closed_total: summary.total_revenue,
            closed_count: summary.closed_count,
            closed_ids: summary.closed_ids,
            still_open,
            cause: cause.unwrap_or_default(),
        }
        .into());
    }

    info!(
        %date,
        total_revenue = summary.total_revenue,
        closed_count = summary.closed_count,
        "closeout complete"
    );
    Ok(summary)
}

/// Returns the transaction total.
fn validate_transaction(transaction: &Transaction) -> Result<i64, EngineError> {
    if transaction.items.is_empty() {
        return Err(ValidationError::EmptyTransaction.into());
    }
    if transaction.items.len() > MAX_LINE_ITEMS_PER_TRANSACTION {
        return Err(EngineError::LimitExceeded("too many line items"));
    }
    if let Some(item) = transaction.items.iter().find(|i| i.unit_price < 0) {
        return Err(ValidationError::NegativeAmount {
            field: "unit_price",
            amount: item.unit_price,
        }
        .into());
    }
    transaction
        .total()
        .filter(|total| *total <= MAX_TRANSACTION_TOTAL)
        .ok_or(EngineError::LimitExceeded("transaction total too large"))
}

impl Scheduler {
    /// Store a point-of-sale transaction for later closeout.
    pub async fn record_transaction(&self, transaction: Transaction) -> Result<Transaction, EngineError> {
        observe("record_transaction", self.record_transaction_inner(transaction)).await
    }

    async fn record_transaction_inner(&self, transaction: Transaction) -> Result<Transaction, EngineError> {
        let total = validate_transaction(&transaction)?;
        self.store().record_transaction(&transaction).await?;
        info!(
            transaction_id = %transaction.id,
            total,
            "transaction recorded"
        );
        Ok(transaction)
    }

    /// Run the daily closeout for `date` in the salon's zone `tz`.
    pub async fn closeout<Tz: TimeZone>(
        &self,
        date: NaiveDate,
        tz: &Tz,
    ) -> Result<CloseoutSummary, EngineError> {
        observe("closeout", run_closeout(self.store().as_ref(), date, tz)).await
    }
}
