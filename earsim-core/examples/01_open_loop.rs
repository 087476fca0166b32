//! Open-loop simulation: run the plant with no controller and watch the
//! noise arrive at both microphones.
//!
//! Run with: cargo run --example 01_open_loop

use std::time::Duration;

use earsim_core::{rms, AncEngine, AudioSourceConfig, Config};

fn main() -> anyhow::Result<()> {
    let mut config = Config::default();
    config.seed = Some(42);
    config.source = AudioSourceConfig::Synthetic { realtime: true };

    let mut engine = AncEngine::new(config)?;
    // A controller that keeps the speaker silent.
    engine.set_process_mics(|_mics, control| control.fill(0.0));
    engine.start()?;

    println!("running open loop for 2 seconds...");
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(100));
        if let Some(mics) = engine.get_mics() {
            println!(
                "  block {:4}  outside rms {:.5}  in-ear rms {:.5}",
                mics.seq,
                rms(&mics.outside),
                rms(&mics.inear)
            );
        }
    }

    engine.stop();
    println!("done after {} blocks", engine.ticks());
    Ok(())
}
