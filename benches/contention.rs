use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use fleetslot::config::EngineConfig;
use fleetslot::engine::{Engine, Journal, MemoryJournal, SystemClock};
use fleetslot::model::BookingRequest;

const HOUR: i64 = 3_600_000;
const DAY_ZERO: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

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

fn memory_engine() -> Arc<Engine> {
    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    Arc::new(Engine::from_parts(
        &[],
        journal,
        Arc::new(SystemClock),
        EngineConfig::default(),
    ))
}

fn wal_engine() -> Arc<Engine> {
    let dir = std::env::temp_dir().join(format!("fleetslot_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    Arc::new(Engine::open(&dir.join("fleetslot.wal"), EngineConfig::default()).unwrap())
}

async fn register_fleet(engine: &Engine, n: usize) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        engine
            .register_vehicle(id, format!("Fleet-{i:03}"), 1000 + (i as u32 % 4) * 500, 6)
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

fn request(vehicle_id: Ulid, start: i64, customer: usize) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        vehicle_id,
        origin: "110001".into(),
        destination: "400001".into(),
        start,
        customer_id: format!("cust-{customer}"),
    }
}

/// Back-to-back 8h trips on one vehicle, one at a time.
async fn phase1_sequential(label: &str, engine: Arc<Engine>) {
    let vid = register_fleet(&engine, 1).await[0];
    let n = 2_000;
    let mut latencies = Vec::with_capacity(n);

    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        engine
            .create_booking(request(vid, DAY_ZERO + (i as i64) * 8 * HOUR, i))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  [{label}] {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("booking latency", &mut latencies);
}

/// Many tasks racing for the same window on one vehicle. Exactly one may win per round.
async fn phase2_same_window(engine: Arc<Engine>) {
    let vid = register_fleet(&engine, 1).await[0];
    let rounds = 200;
    let racers = 16;
    let mut latencies = Vec::new();
    let mut winners = 0usize;

    let start = Instant::now();
    for round in 0..rounds {
        let window = DAY_ZERO + (round as i64) * 8 * HOUR;
        let mut handles = Vec::with_capacity(racers);
        for r in 0..racers {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                let t = Instant::now();
                let ok = engine.create_booking(request(vid, window, r)).await.is_ok();
                (ok, t.elapsed())
            }));
        }
        let mut round_wins = 0;
        for h in handles {
            let (ok, took) = h.await.unwrap();
            latencies.push(took);
            if ok {
                round_wins += 1;
            }
        }
        assert_eq!(round_wins, 1, "round {round}: {round_wins} winners");
        winners += round_wins;
    }
    let elapsed = start.elapsed();
    println!(
        "  {rounds} rounds x {racers} racers: {winners} winners in {:.2}s",
        elapsed.as_secs_f64()
    );
    print_latency("attempt latency", &mut latencies);
}

/// Independent vehicles booked in parallel; no two tasks touch the same vehicle.
async fn phase3_disjoint(engine: Arc<Engine>) {
    let n_tasks = 16;
    let n_per_task = 250;
    let fleet = register_fleet(&engine, n_tasks).await;

    let start = Instant::now();
    let mut handles = Vec::new();
    for (i, vid) in fleet.into_iter().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                engine
                    .create_booking(request(vid, DAY_ZERO + (j as i64) * 8 * HOUR, i))
                    .await
                    .unwrap();
            }
        }));
    }
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

/// Availability searches while writers keep booking.
async fn phase4_search_under_load(engine: Arc<Engine>) {
    let fleet = register_fleet(&engine, 32).await;

    let writers: Vec<_> = fleet
        .iter()
        .copied()
        .enumerate()
        .map(|(i, vid)| {
            let engine = engine.clone();
            tokio::spawn(async move {
                for j in 0..200 {
                    let _ = engine
                        .create_booking(request(vid, DAY_ZERO + (j as i64) * 8 * HOUR, i))
                        .await;
                }
            })
        })
        .collect();

    let mut latencies = Vec::new();
    for j in 0..500 {
        let t = Instant::now();
        engine
            .search_available(500, "110001", "400001", DAY_ZERO + (j as i64 % 200) * 8 * HOUR)
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    for w in writers {
        w.await.unwrap();
    }
    print_latency("search latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("=== fleetslot contention benchmark ===\n");

    println!("[phase 1] sequential bookings");
    phase1_sequential("memory", memory_engine()).await;
    phase1_sequential("wal", wal_engine()).await;

    println!("\n[phase 2] racing for one window");
    phase2_same_window(wal_engine()).await;

    println!("\n[phase 3] disjoint vehicles in parallel");
    phase3_disjoint(wal_engine()).await;

    println!("\n[phase 4] search under write load");
    phase4_search_under_load(wal_engine()).await;

    println!("\n=== benchmark complete ===");
}
