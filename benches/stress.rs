use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, Local, NaiveDate};
use ulid::Ulid;

use slotline::engine::{Engine, EngineError, NewBooking, NewBusiness, NewService};
use slotline::model::{ClockTime, Customer};
use slotline::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let ms = |d: Duration| d.as_secs_f64() * 1000.0;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        ms(avg),
        ms(percentile(latencies, 50.0)),
        ms(percentile(latencies, 95.0)),
        ms(percentile(latencies, 99.0)),
        ms(latencies[latencies.len() - 1]),
    );
}

struct Shop {
    business_id: Ulid,
    service_id: Ulid,
    staff: Vec<Ulid>,
}

fn day(offset: u64) -> NaiveDate {
    Local::now()
        .date_naive()
        .checked_add_days(Days::new(offset + 1))
        .unwrap()
}

fn customer(i: usize) -> Customer {
    Customer {
        name: format!("Bench {i}"),
        email: format!("bench{i}@example.com"),
        phone: None,
    }
}

fn request(shop: &Shop, staff_id: Ulid, date: NaiveDate, slot: usize, i: usize) -> NewBooking {
    NewBooking {
        business_id: shop.business_id,
        service_id: shop.service_id,
        staff_id: Some(staff_id),
        date,
        start_time: ClockTime::from_minutes((slot * 30) as i32).unwrap(),
        customer: customer(i),
    }
}

async fn setup(engine: &Engine, slug: &str, staff: usize) -> Shop {
    let business = engine
        .register_business(NewBusiness {
            slug: slug.into(),
            name: "Bench".into(),
            cancellation_hours: None,
        })
        .await
        .unwrap();
    let mut ids = Vec::new();
    for i in 0..staff {
        ids.push(engine.add_staff(business.id, &format!("Staff {i}")).await.unwrap().id);
    }
    for dow in 0..7 {
        engine
            .set_window(business.id, None, dow, ClockTime::MIDNIGHT, ClockTime::END_OF_DAY)
            .await
            .unwrap();
    }
    let service = engine
        .define_service(
            business.id,
            NewService {
                name: "Slot".into(),
                duration_minutes: 30,
                price: 0,
                sort_order: 0,
                staff: ids.clone(),
            },
        )
        .await
        .unwrap();
    println!("  set up {slug} with {staff} staff");
    Shop {
        business_id: business.id,
        service_id: service.id,
        staff: ids,
    }
}

async fn phase1_sequential(engine: &Engine, shop: &Shop) {
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let req = request(shop, shop.staff[0], day((i / 48) as u64), i % 48, i);
        let t = Instant::now();
        engine.create_booking(req).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(engine: &Arc<Engine>, shop: &Arc<Shop>) {
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    // One task per staff lane: no two tasks ever contend.
    for (task, staff_id) in shop.staff.iter().copied().enumerate() {
        let engine = engine.clone();
        let shop = shop.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let req = request(&shop, staff_id, day(60 + (j / 48) as u64), j % 48, task * n_per_task + j);
                engine.create_booking(req).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = shop.staff.len() * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {} lanes x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        shop.staff.len(),
        elapsed.as_secs_f64()
    );
}

async fn phase3_contention(engine: &Arc<Engine>, shop: &Arc<Shop>) {
    let rounds = 48;
    let contenders = 16;
    let mut winners = 0;
    let mut conflicts = 0;
    let start = Instant::now();

    for round in 0..rounds {
        let mut handles = Vec::new();
        for c in 0..contenders {
            let engine = engine.clone();
            let req = request(shop, shop.staff[1], day(120), round, round * contenders + c);
            handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
        }
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(EngineError::SlotUnavailable(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    println!(
        "  {rounds} rounds x {contenders} contenders in {:.2}s: {winners} won, {conflicts} rejected",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(winners, rounds, "exactly one winner per contended slot");
}

async fn phase4_reads_under_load(engine: &Arc<Engine>, shop: &Arc<Shop>) {
    let writer = {
        let engine = engine.clone();
        let shop = shop.clone();
        tokio::spawn(async move {
            for i in 0..1000 {
                let staff_id = shop.staff[i % shop.staff.len()];
                let req = request(&shop, staff_id, day(200 + (i / 200) as u64), (i / shop.staff.len()) % 48, i);
                let _ = engine.create_booking(req).await;
            }
        })
    };

    let mut latencies = Vec::new();
    let start = Instant::now();
    while !writer.is_finished() {
        let t = Instant::now();
        let listing = engine
            .slots(shop.business_id, shop.service_id, day(200), None)
            .await
            .unwrap();
        latencies.push(t.elapsed());
        std::hint::black_box(listing);
    }
    writer.await.unwrap();

    println!(
        "  {} slot queries during 1000 writes in {:.2}s",
        latencies.len(),
        start.elapsed().as_secs_f64()
    );
    print_latency("read latency", &mut latencies);
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let dir = std::env::temp_dir().join(format!("slotline_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("bench.wal"), Arc::new(NotifyHub::new())).unwrap());

    println!("setup");
    let shop = Arc::new(setup(&engine, "bench", 10).await);

    println!("phase 1: sequential bookings, one lane");
    phase1_sequential(&engine, &shop).await;

    println!("phase 2: concurrent bookings, disjoint lanes");
    phase2_concurrent(&engine, &shop).await;

    println!("phase 3: contention on a single slot");
    phase3_contention(&engine, &shop).await;

    println!("phase 4: slot queries under write load");
    phase4_reads_under_load(&engine, &shop).await;

    let _ = std::fs::remove_dir_all(&dir);
}
