// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Demo: coordinator / worker round trip over one region.
//
// Without arguments, creates a region, prints its name, seeds the root
// dictionary and waits for a worker to answer. With a region name as the
// first argument, attaches as a worker, reads the seeded entry and writes
// the answer back.
//
// Try it in two terminals:
//   terminal 1:  demo_store
//   terminal 2:  demo_store <region-id printed by terminal 1>

use std::time::{Duration, Instant};

use shmstore::{Region, ThreadContext};

fn run_coordinator() -> std::io::Result<()> {
    let region = Region::create()?;
    let thread = ThreadContext::new(region.clone())?;
    println!("region: {}", region.id());

    let root = region
        .root_dict(&thread)
        .expect("root dictionary creation failed");
    root.set_str(&thread, "question", "ping")
        .expect("seeding the root dictionary failed");
    println!("seeded question=ping; waiting for a worker (30s)...");

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Ok(Some(answer)) = root.get_str(&thread, "answer") {
            println!("worker answered: {answer}");
            break;
        }
        if Instant::now() >= deadline {
            println!("no worker showed up; exiting anyway");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(thread);
    Ok(())
}

fn run_worker(name: &str) -> std::io::Result<()> {
    let region = Region::attach(name)?;
    let thread = ThreadContext::new(region.clone())?;

    let root = region
        .root_dict(&thread)
        .expect("root dictionary lookup failed");
    let question = root
        .get_str(&thread, "question")
        .expect("reading the question failed")
        .unwrap_or_default();
    println!("coordinator asks: {question}");

    let answer = if question == "ping" { "pong" } else { "what?" };
    root.set_str(&thread, "answer", answer)
        .expect("writing the answer failed");
    println!("answered: {answer}");
    drop(thread);
    Ok(())
}

fn main() -> std::io::Result<()> {
    match std::env::args().nth(1) {
        Some(name) => run_worker(&name),
        None => run_coordinator(),
    }
}
