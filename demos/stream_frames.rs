//! Run the asynchronous producer for a few seconds and report throughput

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use station_capture::{CaptureResult, MultiMonitorCapture};

fn main() -> CaptureResult<()> {
    env_logger::init();

    println!("Station Capture - Streaming Demo");
    println!("================================\n");

    let mut capture = MultiMonitorCapture::new()?;
    capture.initialize()?;
    capture.set_global_fps(60.0)?;
    capture.set_adaptive(true);

    let rounds = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));
    let dirty = Arc::new(AtomicU64::new(0));

    let cb_rounds = Arc::clone(&rounds);
    let cb_bytes = Arc::clone(&bytes);
    let cb_dirty = Arc::clone(&dirty);
    capture.set_frame_callback(move |frame| {
        cb_rounds.fetch_add(1, Ordering::Relaxed);
        cb_bytes.fetch_add(frame.total_bytes, Ordering::Relaxed);
        let regions: u64 = frame.frames.iter().map(|f| f.dirty.len() as u64).sum();
        cb_dirty.fetch_add(regions, Ordering::Relaxed);
    });

    capture.set_error_observer(|err| {
        eprintln!("capture error: {}", err);
    });

    capture.start()?;
    println!("producer running for 5 seconds...");
    std::thread::sleep(Duration::from_secs(5));
    capture.stop();

    let rounds = rounds.load(Ordering::Relaxed);
    println!("\ndelivered {} aggregate frame(s)", rounds);
    println!(
        "payload: {:.1} MiB, dirty regions: {}",
        bytes.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
        dirty.load(Ordering::Relaxed)
    );
    println!("average latency: {:?}", capture.average_latency());

    for m in capture.monitors() {
        println!(
            "monitor {}: target now {:.1} fps",
            m.id,
            capture.monitor_fps(m.id)?
        );
    }

    Ok(())
}
