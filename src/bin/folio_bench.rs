//! Folio load generator.
//!
//! A standalone binary for exercising a live endpoint under load. Run with:
//! `cargo run --release --bin folio-bench -- [OPTIONS]`
//!
//! This is separate from the regular test suite because it needs a real
//! server, can take a while, and reports throughput rather than pass/fail.
//!
//! # Examples
//!
//! ```bash
//! # Default: 1000 records, 100 commits of updates, 10 points of history
//! cargo run --release --bin folio-bench
//!
//! # Larger run against a remote namespace
//! cargo run --release --bin folio-bench -- --uri redis://10.0.0.5:6379/3 --recs 10000
//! ```

use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use rand::{distributions::Alphanumeric, Rng};

use folio_redis::{
    Diff, Dict, Filter, FolioConfig, HisItem, HisWriteOpts, Number, ReadOpts, RecordStore, Ref,
};

struct Config {
    uri: String,
    num_recs: usize,
    num_updates: usize,
    num_points: usize,
    samples_per_point: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: "redis://localhost:6379/0".to_string(),
            num_recs: 1000,
            num_updates: 100,
            num_points: 10,
            samples_per_point: 1000,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--uri" | "-u" => {
                i += 1;
                config.uri = args[i].clone();
            }
            "--recs" | "-r" => {
                i += 1;
                config.num_recs = args[i].parse().expect("invalid --recs value");
            }
            "--updates" => {
                i += 1;
                config.num_updates = args[i].parse().expect("invalid --updates value");
            }
            "--points" | "-p" => {
                i += 1;
                config.num_points = args[i].parse().expect("invalid --points value");
            }
            "--samples" => {
                i += 1;
                config.samples_per_point = args[i].parse().expect("invalid --samples value");
            }
            other => {
                eprintln!("unknown option: {}", other);
                std::process::exit(2);
            }
        }
        i += 1;
    }
    config
}

fn rand_id(rng: &mut impl Rng, n: usize) -> Ref {
    let suffix: String = rng.sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    Ref::new(format!("bench-{}-{}", n, suffix.to_lowercase()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> folio_redis::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();
    println!("folio-bench: endpoint {}", config.uri);
    println!(
        "  {} recs, {} update commits, {} points x {} samples",
        config.num_recs, config.num_updates, config.num_points, config.samples_per_point
    );

    let store = RecordStore::open(FolioConfig::new("bench").endpoint(&config.uri)?)?;
    let mut rng = rand::thread_rng();

    // ---- adds -------------------------------------------------------------
    let start = Instant::now();
    let mut ids = Vec::with_capacity(config.num_recs);
    for n in 0..config.num_recs {
        let id = rand_id(&mut rng, n);
        let dict = Dict::new()
            .set_marker("equip")
            .set_marker("bench")
            .set("dis", format!("Bench Equip {}", n))
            .set("load", Number::with_unit(rng.gen_range(0.0..100.0), "%"));
        store.commit_one(Diff::add(id.clone(), dict)).await?;
        ids.push(id);
    }
    let elapsed = start.elapsed();
    println!(
        "adds:    {} recs in {:.2?} ({:.0} recs/s)",
        config.num_recs,
        elapsed,
        config.num_recs as f64 / elapsed.as_secs_f64()
    );

    // ---- updates ----------------------------------------------------------
    let start = Instant::now();
    for _ in 0..config.num_updates {
        let id = &ids[rng.gen_range(0..ids.len())];
        let rec = store.read_by_id(id)?;
        let diff = Diff::update(
            &rec,
            Dict::new().set("load", Number::with_unit(rng.gen_range(0.0..100.0), "%")),
        )?;
        store.commit_one(diff).await?;
    }
    let elapsed = start.elapsed();
    println!(
        "updates: {} commits in {:.2?} ({:.0} commits/s)",
        config.num_updates,
        elapsed,
        config.num_updates as f64 / elapsed.as_secs_f64()
    );

    // ---- queries ----------------------------------------------------------
    let start = Instant::now();
    let count = store.read_count(&Filter::has("bench"), &ReadOpts::default().limit(usize::MAX));
    println!("query:   has(bench) -> {} in {:.2?}", count, start.elapsed());

    // ---- history ----------------------------------------------------------
    let his = store.his();
    let base = Utc::now().with_timezone(&chrono_tz::UTC) - ChronoDuration::hours(24);
    let start = Instant::now();
    let mut written = 0usize;
    for n in 0..config.num_points {
        let id = Ref::new(format!("bench-point-{}", n));
        let point = Dict::new()
            .set_marker("point")
            .set_marker("his")
            .set_marker("bench")
            .set("dis", format!("Bench Point {}", n))
            .set("tz", "UTC")
            .set("kind", "Number");
        store.commit_one(Diff::add(id.clone(), point)).await?;

        let items: Vec<HisItem> = (0..config.samples_per_point)
            .map(|i| {
                HisItem::new(
                    base + ChronoDuration::seconds(i as i64 * 60),
                    Number::new(rng.gen_range(-10.0..40.0)),
                )
            })
            .collect();
        let result = his.write(&id, &items, &HisWriteOpts::default())?;
        written += result.count;
    }
    let elapsed = start.elapsed();
    println!(
        "history: {} items in {:.2?} ({:.0} items/s)",
        written,
        elapsed,
        written as f64 / elapsed.as_secs_f64()
    );

    // ---- cleanup ----------------------------------------------------------
    let start = Instant::now();
    let bench = store.read_all(&Filter::has("bench"), &ReadOpts::default().limit(usize::MAX));
    let mut removed = 0usize;
    for rec in &bench {
        store.commit_one(Diff::remove(rec)?).await?;
        removed += 1;
    }
    println!("cleanup: {} recs in {:.2?}", removed, start.elapsed());

    println!("version: {}", store.cur_ver());
    store.close().await;
    Ok(())
}
