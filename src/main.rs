#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::must_use_candidate,
    clippy::perf
    // clippy::restriction,
    // clippy::pedantic
)]
// now allow a few rules which are denied by the above statement
// --> they are ridiculous and not necessary
#![allow(
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::fallible_impl_from
)]
#![deny(missing_debug_implementations)]

//! Measures the per-phase rendezvous latency of the barrier for several group
//! sizes: the time between the controlling thread's arrival and its release,
//! with the other participants arriving at randomly staggered times.

use phased_barrier::Barrier;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs `rounds` phases with `workers` staggered worker threads plus the
/// controlling thread, and collects the controller's release latencies.
fn run_phases(workers: u32, rounds: usize) -> Vec<Duration> {
    let barrier = Arc::new(Barrier::new(workers + 1).expect("participant count in range"));

    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for _ in 0..rounds {
                    // Random skew so arrivals spread out like in a real
                    // workload.
                    let stagger_us = fastrand::u64(0..200);
                    thread::sleep(Duration::from_micros(stagger_us));
                    barrier.signal_and_wait().expect("barrier round failed");
                }
            })
        })
        .collect();

    let mut latencies = Vec::with_capacity(rounds);
    for _ in 0..rounds {
        let begin = Instant::now();
        barrier.signal_and_wait().expect("barrier round failed");
        latencies.push(begin.elapsed());
    }

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    latencies
}

fn calc_mean(data: &[Duration]) -> Duration {
    let len = data.len();
    if len == 0 {
        Duration::ZERO
    } else {
        let sum = data.iter().sum::<Duration>();
        sum / (len as u32)
    }
}

fn print_analysis(participants: u32, latencies: &[Duration]) {
    let mean = calc_mean(latencies);
    let max = latencies.iter().max().copied().unwrap_or_default();

    println!("Participants  (#): {participants}");
    println!("  rounds      (#): {}", latencies.len());
    println!("  mean latency   : {:>5} µs", mean.as_micros());
    println!("  max latency    : {:>5} µs", max.as_micros());
}

fn main() {
    let rounds = 1000;

    for workers in [1, 2, 4, 8] {
        println!(
            "BENCH RUN: {} participants, rounds={rounds}",
            workers + 1
        );
        let latencies = run_phases(workers, rounds);
        print_analysis(workers + 1, &latencies);
        println!();
    }
}
