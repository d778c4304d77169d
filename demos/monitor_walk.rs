//! Enumerate monitors and run a few synchronous capture rounds

use std::time::Instant;

use station_capture::{CaptureResult, MultiMonitorCapture};

fn main() -> CaptureResult<()> {
    env_logger::init();

    println!("Station Capture - Monitor Walk");
    println!("==============================\n");

    let mut capture = MultiMonitorCapture::new()?;
    capture.initialize()?;

    let monitors = capture.monitors();
    println!("Detected {} monitor(s):", monitors.len());
    for m in &monitors {
        println!(
            "  [{}] {} {}x{} at ({}, {}), scale {:.2}{}",
            m.id,
            m.name,
            m.width,
            m.height,
            m.x,
            m.y,
            m.scale_factor,
            if m.is_primary { " (primary)" } else { "" }
        );
    }

    capture.set_global_fps(30.0)?;
    capture.start()?;

    for round in 1..=5 {
        let started = Instant::now();
        let aggregate = capture.capture_all()?;
        println!(
            "\nround {}: {} frame(s), {} KiB in {:?}",
            round,
            aggregate.frames.len(),
            aggregate.total_bytes / 1024,
            started.elapsed()
        );

        for frame in &aggregate.frames {
            println!(
                "  monitor {}: {} dirty region(s)",
                frame.monitor_id,
                frame.dirty.len()
            );
            for rect in frame.dirty.iter().take(4) {
                println!(
                    "    {}x{} at ({}, {}){}",
                    rect.width,
                    rect.height,
                    rect.x,
                    rect.y,
                    if rect.merged { " [merged]" } else { "" }
                );
            }
        }

        for (id, reason) in &aggregate.errors {
            println!("  monitor {} skipped: {}", id, reason);
        }
    }

    capture.stop();
    println!("\naverage latency: {:?}", capture.average_latency());
    Ok(())
}
