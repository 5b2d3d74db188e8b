use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use lessond::config::EngineConfig;
use lessond::engine::{Engine, EngineError};
use lessond::model::*;
use lessond::notify::NotifyHub;
use lessond::ports::InMemoryBalances;

const FIRST_DAY: Day = 20157;

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

fn open_engine(balances: Arc<InMemoryBalances>) -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("lessond_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    let engine = Engine::new(
        dir.join("lessons.wal"),
        Arc::new(NotifyHub::new()),
        balances,
        EngineConfig::default(),
    )
    .expect("open engine");
    Arc::new(engine)
}

fn student(balances: &InMemoryBalances, hours: u32) -> Ulid {
    let id = Ulid::new();
    balances.insert(PackageBalance {
        id: Ulid::new(),
        student_id: id,
        hours_remaining: hours,
        is_active: true,
        expires_at: (FIRST_DAY + 365) * DAY_MS,
    });
    id
}

async fn tutor_with_days(engine: &Engine, days: i64) -> Ulid {
    let tutor = Ulid::new();
    engine.register_tutor(tutor, 4_000).await.expect("register tutor");
    let hours: Vec<u8> = (0..24).collect();
    for d in 0..days {
        engine
            .publish_availability(tutor, FIRST_DAY + d, &hours)
            .await
            .expect("publish availability");
    }
    tutor
}

/// One student filling a tutor's calendar hour by hour.
async fn phase1_sequential(engine: &Engine, balances: &InMemoryBalances) {
    let days = 30;
    let tutor = tutor_with_days(engine, days).await;
    let n = (days * 24) as usize;
    let sid = student(balances, n as u32);
    let now = (FIRST_DAY - 1) * DAY_MS;

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let req = BookingRequest {
            student_id: sid,
            tutor_id: tutor,
            start: FIRST_DAY * DAY_MS + i as Ms * HOUR_MS,
            duration_minutes: 60,
        };
        let t = Instant::now();
        engine.book_lesson(req, now).await.expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many students racing for the same few hours of a single tutor.
async fn phase2_contended(engine: Arc<Engine>, balances: Arc<InMemoryBalances>) {
    let n_tasks = 64;
    let tutor = tutor_with_days(&engine, 1).await;
    let now = (FIRST_DAY - 1) * DAY_MS;
    let won = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = engine.clone();
        let won = won.clone();
        let sid = student(&balances, 1);
        handles.push(tokio::spawn(async move {
            let req = BookingRequest {
                student_id: sid,
                tutor_id: tutor,
                start: hour_start(FIRST_DAY, 9 + (i % 4) as u8),
                duration_minutes: 60,
            };
            let t = Instant::now();
            match engine.book_lesson(req, now).await {
                Ok(_) => {
                    won.fetch_add(1, Ordering::Relaxed);
                }
                Err(EngineError::SlotConflict(_)) => {}
                Err(e) => eprintln!("unexpected booking error: {e}"),
            }
            t.elapsed()
        }));
    }

    let mut latencies = Vec::with_capacity(n_tasks);
    for h in handles {
        latencies.push(h.await.expect("booking task panicked"));
    }
    println!(
        "  {n_tasks} requests for 4 hours: {} booked in {:.2}s",
        won.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    print_latency("contended latency", &mut latencies);
}

/// Availability reads while another task keeps booking on the same tutor.
async fn phase3_reads_under_load(engine: Arc<Engine>, balances: Arc<InMemoryBalances>) {
    let days = 10;
    let tutor = tutor_with_days(&engine, days).await;
    let sid = student(&balances, (days * 24) as u32);
    let now = (FIRST_DAY - 1) * DAY_MS;

    let writer_engine = engine.clone();
    let writer = tokio::spawn(async move {
        for i in 0..days * 24 {
            let req = BookingRequest {
                student_id: sid,
                tutor_id: tutor,
                start: FIRST_DAY * DAY_MS + i * HOUR_MS,
                duration_minutes: 60,
            };
            let _ = writer_engine.book_lesson(req, now).await;
        }
    });

    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        let free = engine.available_time_slots(tutor, FIRST_DAY, now).await;
        latencies.push(t.elapsed());
        std::hint::black_box(free);
        tokio::task::yield_now().await;
    }
    writer.await.expect("writer panicked");
    print_latency("read latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== lessond contention benchmark ===\n");
    let balances = Arc::new(InMemoryBalances::new());
    let engine = open_engine(balances.clone());

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&engine, &balances).await;

    println!("\n[phase 2] contended bookings");
    phase2_contended(engine.clone(), balances.clone()).await;

    println!("\n[phase 3] read latency under write load");
    phase3_reads_under_load(engine, balances).await;

    println!("\n=== benchmark complete ===");
}
