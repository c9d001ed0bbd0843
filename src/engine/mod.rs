mod commit;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;

pub use conflict::now_ms;
pub use error::{BookingError, EngineError, FailureKind};
pub use slots::allocate_slots;
pub use store::{SharedStudent, SharedTimeline, Store};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::AtomicBool;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};

use crate::locks::ReservationLockManager;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::tenant::TenantContext;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync; every sender learns the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into
    // the next batch; this batch is reported failed either way.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_and_respond(wal, vec![(event, response)]),
    }
}

/// One tenant's scheduler: ledger, fleet, balances, and the shared lock manager.
pub struct Engine {
    tenant: TenantContext,
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) locks: Arc<ReservationLockManager>,
    /// Writers hold it shared from before their first row lock until applied;
    /// compaction holds it exclusively while it snapshots.
    pub(super) write_gate: RwLock<()>,
    #[cfg(test)]
    pub(super) fail_before_debit: AtomicBool,
}

/// Apply a durable booking row to the guarded rows it touches.
pub(super) fn apply_booking(
    store: &Store,
    booking: &Booking,
    instructor: &mut Timeline,
    vehicle: Option<&mut Timeline>,
    student: Option<&mut Student>,
    debited: u32,
) {
    if booking.status.is_active() {
        let reservation = Reservation {
            booking_id: booking.id,
            span: booking.span,
            status: booking.status,
        };
        instructor.insert(reservation);
        if let Some(vehicle) = vehicle {
            vehicle.insert(reservation);
        }
    }
    if let Some(student) = student {
        student.credits = student.credits.saturating_sub(debited);
    }
    store.insert_booking(booking.clone());
}

/// Move a booking to `status`, stamping the columns that status owns.
pub(super) fn apply_transition(
    store: &Store,
    id: ulid::Ulid,
    status: BookingStatus,
    at: Ms,
    note: Option<String>,
    instructor: &mut Timeline,
    vehicle: Option<&mut Timeline>,
) -> Option<Booking> {
    let updated = store.update_booking(id, |b| {
        b.status = status;
        match status {
            BookingStatus::Cancelled => {
                b.cancelled_at = Some(at);
                b.cancellation_reason = note;
            }
            BookingStatus::Completed => {
                b.completed_at = Some(at);
                b.instructor_notes = note;
            }
            _ => {}
        }
    })?;
    if status.is_active() {
        instructor.set_status(id, status);
        if let Some(vehicle) = vehicle {
            vehicle.set_status(id, status);
        }
    } else {
        instructor.remove(id);
        if let Some(vehicle) = vehicle {
            vehicle.remove(id);
        }
    }
    Some(updated)
}

impl Engine {
    pub fn new(
        tenant: TenantContext,
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        locks: Arc<ReservationLockManager>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant,
            store: Store::new(),
            wal_tx,
            notify,
            locks,
            write_gate: RwLock::new(()),
            #[cfg(test)]
            fail_before_debit: AtomicBool::new(false),
        };

        // We're the sole owner of every Arc here, so try_write always succeeds.
        // Never block_on here: this may run inside an async context.
        let mut foreign = 0usize;
        for event in &events {
            if event.tenant_id().is_some_and(|t| *t != engine.tenant.id) {
                foreign += 1;
                continue;
            }
            engine.replay(event);
        }
        if foreign > 0 {
            warn!(tenant = %engine.tenant.id, skipped = foreign, "WAL holds rows of another tenant, ignored");
        }
        info!(tenant = %engine.tenant.id, events = events.len(), "replayed WAL");

        Ok(engine)
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn locks(&self) -> &Arc<ReservationLockManager> {
        &self.locks
    }

    fn replay(&self, event: &Event) {
        match event {
            Event::RuleAdded(rule) => self.store.insert_rule(rule.clone()),
            Event::RuleRemoved { id } => {
                self.store.remove_rule(*id);
            }
            Event::VehicleUpserted(vehicle) => self.store.upsert_vehicle(vehicle.clone()),
            Event::StudentUpserted(student) => match self.store.shared_student(student.id) {
                Some(existing) => {
                    *existing.try_write().expect("replay: uncontended write") = student.clone();
                }
                None => {
                    self.store.insert_student(student.clone());
                }
            },
            Event::BookingCommitted { booking, debited } => self.replay_booking(booking, *debited, true),
            Event::BookingRestored(booking) => self.replay_booking(booking, 0, false),
            Event::BookingTransitioned { id, status, at, note } => {
                let Some(booking) = self.store.booking(&self.tenant.id, *id) else {
                    return;
                };
                let instructor = self.store.instructor_timeline(booking.instructor_id);
                let mut instructor = instructor.try_write().expect("replay: uncontended write");
                let vehicle = booking.vehicle_id.map(|v| self.store.vehicle_timeline(v));
                let mut vehicle = vehicle
                    .as_ref()
                    .map(|v| v.try_write().expect("replay: uncontended write"));
                apply_transition(
                    &self.store,
                    *id,
                    *status,
                    *at,
                    note.clone(),
                    &mut instructor,
                    vehicle.as_deref_mut(),
                );
            }
        }
    }

    fn replay_booking(&self, booking: &Booking, debited: u32, charge: bool) {
        let instructor = self.store.instructor_timeline(booking.instructor_id);
        let mut instructor = instructor.try_write().expect("replay: uncontended write");
        let vehicle = booking.vehicle_id.map(|v| self.store.vehicle_timeline(v));
        let mut vehicle = vehicle
            .as_ref()
            .map(|v| v.try_write().expect("replay: uncontended write"));
        let student = if charge {
            self.store.shared_student(booking.student_id)
        } else {
            None
        };
        let mut student = student
            .as_ref()
            .map(|s| s.try_write().expect("replay: uncontended write"));
        apply_booking(
            &self.store,
            booking,
            &mut instructor,
            vehicle.as_deref_mut(),
            student.as_deref_mut(),
            debited,
        );
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply, for events that touch only the store's own maps.
    /// Caller holds the write gate.
    pub(super) async fn persist_and_apply(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        match event {
            Event::RuleAdded(rule) => self.store.insert_rule(rule),
            Event::RuleRemoved { id } => {
                self.store.remove_rule(id);
            }
            Event::VehicleUpserted(vehicle) => self.store.upsert_vehicle(vehicle),
            other => unreachable!("persist_and_apply called with row event {other:?}"),
        }
        Ok(())
    }
}
