/**
 * Vacuum Control Example
 *
 * Loads a controller configuration from a JSON file, prints every state the
 * robot publishes and runs a short command sequence.
 *
 * Usage: cargo run --example vacuum_control -- vacuum.json
 * Set RUST_LOG=debug to see the protocol traffic.
 */
use futures_util::StreamExt;
use tuya_vacuum::{VacuumConfig, VacuumController};
use tokio::time::{Duration, sleep};

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- tuya-vacuum - Vacuum Control ---");

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("[ERROR] Usage: vacuum_control <config.json>");
        return;
    };

    // 1. Load configuration and connect
    let config = match VacuumConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[ERROR] Invalid configuration {}: {}", path, e);
            return;
        }
    };
    let vacuum = match VacuumController::new(config) {
        Ok(vacuum) => vacuum,
        Err(e) => {
            eprintln!("[ERROR] Could not create controller: {}", e);
            return;
        }
    };

    // 2. Follow state changes in the background
    let states = vacuum.stream();
    let watcher = tokio::spawn(async move {
        tokio::pin!(states);
        while let Some(state) = states.next().await {
            println!(
                "[STATE] {:?} battery={:?} fan={:?} faults={:?}",
                state.status, state.battery_percent, state.fan_speed, state.faults
            );
        }
    });

    // 3. Wait for the first poll
    for _ in 0..20 {
        if vacuum.is_available() {
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }
    println!("[INFO] Available: {}", vacuum.is_available());
    println!("[INFO] Fan speeds: {:?}", vacuum.fan_speed_list());

    // 4. Run a few commands
    println!("[STEP 1] Starting...");
    if let Err(e) = vacuum.start().await {
        eprintln!("[ERROR] Start failed: {}", e);
    }
    sleep(Duration::from_secs(5)).await;

    println!("[STEP 2] Pausing...");
    if let Err(e) = vacuum.pause().await {
        eprintln!("[ERROR] Pause failed: {}", e);
    }
    sleep(Duration::from_secs(2)).await;

    println!("[STEP 3] Returning to base...");
    if let Err(e) = vacuum.return_to_base().await {
        eprintln!("[ERROR] Return failed: {}", e);
    }
    sleep(Duration::from_secs(2)).await;

    println!("[INFO] Current state: {:?}", vacuum.current_state());
    vacuum.close().await;
    watcher.abort();
    println!("[INFO] Example finished.");
}
