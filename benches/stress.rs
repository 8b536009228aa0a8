use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mockable::DefaultClock;

use courtside::engine::{Actor, CourtInput, Engine, LogEmailSender, ReservationRequest};
use courtside::error::SchedulingError;
use courtside::model::{CourtStatus, Facility, Id, Span, DAY_MS, HOUR_MS};
use courtside::registry::FacilityRegistry;

const COURTS_PER_FACILITY: u32 = 8;

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
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Provision a facility with its courts; returns the court ids.
async fn setup_facility(engine: &Engine, facility_id: Id) -> Vec<Id> {
    engine
        .provision_facility(Facility::new(facility_id, format!("Bench {facility_id}"), "UTC"))
        .unwrap();
    let staff = Actor::staff(1);
    let mut courts = Vec::new();
    for number in 1..=COURTS_PER_FACILITY {
        let court = engine
            .upsert_court(
                &staff,
                facility_id,
                CourtInput {
                    court_id: None,
                    number,
                    status: CourtStatus::Active,
                },
            )
            .await
            .unwrap();
        courts.push(court.id);
    }
    courts
}

fn booking(court_id: Id, start: i64) -> ReservationRequest {
    ReservationRequest {
        reservation_type_id: 1,
        start,
        end: start + HOUR_MS,
        court_ids: vec![court_id],
        ..ReservationRequest::default()
    }
}

async fn phase1_sequential(engine: &Engine, facility_id: Id, court_id: Id, base: i64) {
    let n = 2000;
    let staff = Actor::staff(1);
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .create_reservation(&staff, facility_id, booking(court_id, base + i as i64 * HOUR_MS))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(engine: Arc<Engine>, facilities: &[(Id, Vec<Id>)], base: i64) {
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    // One task per court across all facilities. Courts never collide; commits
    // on one facility queue behind its lock and its log writer.
    for (facility_id, courts) in facilities {
        for court_id in courts {
            let engine = engine.clone();
            let (facility_id, court_id) = (*facility_id, *court_id);
            handles.push(tokio::spawn(async move {
                let staff = Actor::staff(1);
                for j in 0..n_per_task {
                    engine
                        .create_reservation(&staff, facility_id, booking(court_id, base + j as i64 * HOUR_MS))
                        .await
                        .unwrap();
                }
            }));
        }
    }
    let n_tasks = handles.len();
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contended(engine: Arc<Engine>, facility_id: Id, court_id: Id, base: i64) {
    let slots = 100;
    let contenders = 16;
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for slot in 0..slots {
        let mut handles = Vec::new();
        for user in 0..contenders {
            let engine = engine.clone();
            let wins = wins.clone();
            let conflicts = conflicts.clone();
            handles.push(tokio::spawn(async move {
                let member = Actor::member(1000 + user);
                let at = base + slot * HOUR_MS;
                match engine.create_reservation(&member, facility_id, booking(court_id, at)).await {
                    Ok(_) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(SchedulingError::Conflict { .. }) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    let elapsed = start.elapsed();
    let won = wins.load(Ordering::Relaxed);
    println!(
        "  {slots} slots x {contenders} contenders: {won} won, {} conflicts in {:.2}s",
        conflicts.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    assert_eq!(won as i64, slots, "every slot must have exactly one winner");
}

async fn phase4_read_under_load(engine: Arc<Engine>, facility_id: Id, courts: Vec<Id>, base: i64) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for (w, court_id) in courts.into_iter().enumerate() {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let staff = Actor::staff(1);
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let at = base + (w as i64 * 10_000 + i) * HOUR_MS;
                let _ = engine.create_reservation(&staff, facility_id, booking(court_id, at)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let window = Span::new(base, base + 7 * DAY_MS);
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine.reservations_between(facility_id, window).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }
    print_latency("reservations_between", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let data_dir = std::env::temp_dir().join("courtside_bench");
    let _ = std::fs::remove_dir_all(&data_dir);
    std::fs::create_dir_all(&data_dir).unwrap();

    println!("=== courtside stress benchmark ===");
    println!("data_dir: {}\n", data_dir.display());

    let registry = Arc::new(FacilityRegistry::open(&data_dir).unwrap());
    let engine = Arc::new(Engine::new(registry, Arc::new(DefaultClock), Arc::new(LogEmailSender)));
    // Far enough ahead that member checks never see the past.
    let base = (engine.now() / DAY_MS + 2) * DAY_MS;

    println!("[setup]");
    let mut facilities = Vec::new();
    for facility_id in 1..=4 {
        let courts = setup_facility(&engine, facility_id).await;
        facilities.push((facility_id, courts));
    }
    println!("  created {} facilities x {COURTS_PER_FACILITY} courts", facilities.len());

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&engine, 1, facilities[0].1[0], base).await;

    println!("\n[phase 2] concurrent write throughput");
    let fresh = base + 3000 * HOUR_MS;
    phase2_concurrent(engine.clone(), &facilities[1..3], fresh).await;

    println!("\n[phase 3] contended bookings on one court");
    phase3_contended(engine.clone(), 4, facilities[3].1[0], base).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(engine.clone(), 4, facilities[3].1[1..].to_vec(), base).await;

    println!("\n=== done ===");
}
