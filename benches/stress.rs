use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use salon_sched::engine::{CreateReservation, EngineError, Scheduler};
use salon_sched::model::*;
use salon_sched::store::InMemoryStore;

/// 2024-01-15 00:00 UTC.
const DAY: Ms = 1_705_276_800_000;
const SLOT: Ms = 15 * MINUTE;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn booking(therapist_id: Ulid, start: Ms, duration: Ms) -> CreateReservation {
    CreateReservation {
        client_id: Ulid::new(),
        service_id: Ulid::new(),
        therapist_id,
        start_time: start,
        duration,
        price: 5_000,
        notes: None,
    }
}

/// Cheap deterministic spread of start slots so tasks collide often.
fn slot_for(task: usize, i: usize) -> i64 {
    ((task * 7919 + i * 104_729) % 2_000) as i64
}

async fn phase1_sequential(scheduler: &Scheduler) {
    let therapist = Ulid::new();
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        scheduler
            .create(booking(therapist, DAY + i as i64 * HOUR, HOUR))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_contended(scheduler: Arc<Scheduler>, therapists: &[Ulid]) {
    let n_tasks = 16;
    let n_per_task = 250;
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let scheduler = scheduler.clone();
        let therapist = therapists[task % therapists.len()];
        let accepted = accepted.clone();
        let rejected = rejected.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(n_per_task);
            for i in 0..n_per_task {
                let start = DAY + slot_for(task, i) * SLOT;
                let duration = SLOT * (1 + (i % 6) as i64);
                let t = Instant::now();
                match scheduler.create(booking(therapist, start, duration)).await {
                    Ok(_) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::Conflict(_)) => rejected.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} creates on {} therapists in {:.2}s = {:.0} ops/sec",
        therapists.len(),
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  accepted={}, rejected={}",
        accepted.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed)
    );
    print_latency("create latency (contended)", &mut all);
}

async fn phase3_moves_under_load(scheduler: Arc<Scheduler>, therapists: &[Ulid]) {
    let stop = Arc::new(AtomicBool::new(false));

    // Background writers keep the calendars busy.
    let mut writers = Vec::new();
    for (w, &therapist) in therapists.iter().enumerate() {
        let scheduler = scheduler.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let start = DAY + slot_for(w + 100, i) * SLOT;
                let _ = scheduler.create(booking(therapist, start, SLOT)).await;
                i += 1;
                tokio::task::yield_now().await;
            }
        }));
    }

    let mut movers = Vec::new();
    for m in 0..8 {
        let scheduler = scheduler.clone();
        let therapists = therapists.to_vec();
        movers.push(tokio::spawn(async move {
            let home = therapists[m % therapists.len()];
            let Ok(r) = scheduler
                .create(booking(home, DAY + 400 * HOUR + m as i64 * HOUR, HOUR))
                .await
            else {
                return Vec::new();
            };
            let mut latencies = Vec::with_capacity(200);
            for i in 0..200 {
                let target = therapists[(m + i) % therapists.len()];
                let start = DAY + slot_for(m, i) * SLOT;
                let t = Instant::now();
                let _ = scheduler.move_reservation(r.id, start, Some(target)).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in movers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("move latency under write load", &mut all);
}

async fn assert_no_overlaps(scheduler: &Scheduler, therapists: &[Ulid]) {
    for &therapist in therapists {
        let index = scheduler.index(therapist).await.unwrap();
        let pairs = index.overlapping_pairs();
        assert!(
            pairs.is_empty(),
            "therapist {therapist} double-booked: {pairs:?}"
        );
        println!("  therapist {therapist}: {} intervals, no overlaps", index.len());
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    println!("=== salon-sched stress benchmark ===\n");

    let store = Arc::new(InMemoryStore::new());
    let scheduler = Arc::new(Scheduler::new(store.clone()));
    let therapists: Vec<Ulid> = (0..4).map(|_| Ulid::new()).collect();

    println!("[phase 1] sequential create throughput");
    phase1_sequential(&scheduler).await;

    println!("\n[phase 2] contended creates");
    phase2_contended(scheduler.clone(), &therapists).await;

    println!("\n[phase 3] cross-therapist moves under write load");
    phase3_moves_under_load(scheduler.clone(), &therapists).await;

    println!("\n[verify]");
    assert_no_overlaps(&scheduler, &therapists).await;
    println!("\n  {} reservations stored", store.reservation_count());

    println!("\n=== done ===");
}
