//! Frame-to-frame dirty-region tracking
//!
//! The tracker compares the current frame against the previous one in
//! fixed-size blocks and emits a bounded, merged set of change
//! rectangles. It runs only when the backend reported no change hints of
//! its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{monotonic_micros, DirtyRect, TrackerOptions};

/// Comparison granularity in pixels; edge blocks are clipped to fit
pub const BLOCK_SIZE: u32 = 32;

const BYTES_PER_PIXEL: usize = 4;

/// Tracker counters, for observability
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    pub pixels_compared: u64,
    pub regions_emitted: u64,
    /// Wall time of the most recent detection pass
    pub last_detection: Option<Duration>,
}

/// Per-monitor dirty-region tracker
pub struct DirtyRegionTracker {
    monitor_id: u32,
    options: TrackerOptions,
    width: u32,
    height: u32,
    /// Previous frame, tightly packed at `width * 4` bytes per row
    previous: Option<Vec<u8>>,
    pixels_compared: AtomicU64,
    regions_emitted: AtomicU64,
    last_detection: Option<Duration>,
}

impl DirtyRegionTracker {
    pub fn new(monitor_id: u32, options: TrackerOptions) -> Self {
        Self {
            monitor_id,
            options,
            width: 0,
            height: 0,
            previous: None,
            pixels_compared: AtomicU64::new(0),
            regions_emitted: AtomicU64::new(0),
            last_detection: None,
        }
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: TrackerOptions) {
        self.options = options;
    }

    /// Forget the previous frame; the next pass reports full-frame dirty
    pub fn reset(&mut self) {
        self.previous = None;
        self.width = 0;
        self.height = 0;
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            pixels_compared: self.pixels_compared.load(Ordering::Relaxed),
            regions_emitted: self.regions_emitted.load(Ordering::Relaxed),
            last_detection: self.last_detection,
        }
    }

    /// Compare `frame` against the stored previous frame and return the
    /// merged change rectangles.
    ///
    /// `frame` is BGRA, `stride` bytes per row. A first call, or a call
    /// with dimensions differing from the stored frame, re-initialises
    /// the tracker and reports a single full-frame rectangle.
    pub fn track(&mut self, frame: &[u8], width: u32, height: u32, stride: usize) -> Vec<DirtyRect> {
        let started = Instant::now();

        let reinit = self.previous.is_none() || self.width != width || self.height != height;
        if reinit {
            self.width = width;
            self.height = height;
            self.previous = Some(pack_frame(frame, width, height, stride));
            self.last_detection = Some(started.elapsed());
            let full = DirtyRect::new(0, 0, width, height, self.monitor_id);
            self.regions_emitted.fetch_add(1, Ordering::Relaxed);
            return vec![full];
        }

        let previous = self.previous.as_ref().expect("previous frame present");
        let packed_stride = width as usize * BYTES_PER_PIXEL;
        let timestamp_us = monotonic_micros();

        let mut regions = Vec::new();
        let mut y = 0u32;
        while y < height {
            let block_h = BLOCK_SIZE.min(height - y);
            let mut x = 0u32;
            while x < width {
                let block_w = BLOCK_SIZE.min(width - x);
                if block_differs(
                    frame,
                    stride,
                    previous,
                    packed_stride,
                    x,
                    y,
                    block_w,
                    block_h,
                    self.options.threshold,
                ) {
                    regions.push(DirtyRect {
                        x: x as i32,
                        y: y as i32,
                        width: block_w,
                        height: block_h,
                        monitor_id: self.monitor_id,
                        timestamp_us,
                        merged: false,
                    });
                }
                self.pixels_compared
                    .fetch_add(block_w as u64 * block_h as u64, Ordering::Relaxed);
                x += BLOCK_SIZE;
            }
            y += BLOCK_SIZE;
        }

        // Refresh the reference frame before post-processing.
        repack_into(self.previous.as_mut().expect("previous frame present"), frame, width, height, stride);

        regions.retain(|r| r.width >= self.options.min_width && r.height >= self.options.min_height);

        if self.options.merge_enabled && regions.len() > 1 {
            regions = absorb_merge(regions);
        }

        if regions.len() > self.options.max_region_count {
            regions.truncate(self.options.max_region_count);
        }

        self.regions_emitted
            .fetch_add(regions.len() as u64, Ordering::Relaxed);
        self.last_detection = Some(started.elapsed());
        regions
    }
}

/// Sort by (x, y) then merge touching rectangles to a fixed point.
///
/// The result does not depend on input order: merging repeats until no
/// pair of rectangles touches, so any ordering converges to the same
/// set of bounding boxes.
pub fn merge_regions(mut regions: Vec<DirtyRect>) -> Vec<DirtyRect> {
    regions.sort_by(|a, b| a.x.cmp(&b.x).then(a.y.cmp(&b.y)));
    absorb_merge(regions)
}

/// Iterate absorb passes until the region count stabilises
pub(crate) fn absorb_merge(mut regions: Vec<DirtyRect>) -> Vec<DirtyRect> {
    loop {
        let before = regions.len();
        regions = absorb_pass(regions);
        if regions.len() == before {
            return regions;
        }
    }
}

/// One pass: each unabsorbed seed repeatedly swallows any region that
/// touches its (growing) bounding box
fn absorb_pass(regions: Vec<DirtyRect>) -> Vec<DirtyRect> {
    if regions.len() <= 1 {
        return regions;
    }

    let mut used = vec![false; regions.len()];
    let mut merged = Vec::with_capacity(regions.len());

    for i in 0..regions.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut current = regions[i];

        let mut absorbed_any = true;
        while absorbed_any {
            absorbed_any = false;
            for j in 0..regions.len() {
                if used[j] {
                    continue;
                }
                if current.touches(&regions[j]) {
                    current = current.union_with(&regions[j]);
                    used[j] = true;
                    absorbed_any = true;
                }
            }
        }

        merged.push(current);
    }

    merged
}

fn pack_frame(frame: &[u8], width: u32, height: u32, stride: usize) -> Vec<u8> {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    let mut packed = vec![0u8; row_bytes * height as usize];
    repack_into(&mut packed, frame, width, height, stride);
    packed
}

fn repack_into(packed: &mut [u8], frame: &[u8], width: u32, height: u32, stride: usize) {
    let row_bytes = width as usize * BYTES_PER_PIXEL;
    for y in 0..height as usize {
        let src = &frame[y * stride..y * stride + row_bytes];
        packed[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src);
    }
}

/// Sum of absolute per-channel differences across the block, normalised
/// by `pixels * 255 * 4`, against the threshold
#[allow(clippy::too_many_arguments)]
fn block_differs(
    current: &[u8],
    current_stride: usize,
    previous: &[u8],
    previous_stride: usize,
    x: u32,
    y: u32,
    block_w: u32,
    block_h: u32,
    threshold: f64,
) -> bool {
    let row_bytes = block_w as usize * BYTES_PER_PIXEL;
    let mut total_diff = 0u64;

    for row in 0..block_h as usize {
        let cur_off = (y as usize + row) * current_stride + x as usize * BYTES_PER_PIXEL;
        let prev_off = (y as usize + row) * previous_stride + x as usize * BYTES_PER_PIXEL;
        let cur = &current[cur_off..cur_off + row_bytes];
        let prev = &previous[prev_off..prev_off + row_bytes];

        for (a, b) in cur.iter().zip(prev.iter()) {
            total_diff += (*a as i32 - *b as i32).unsigned_abs() as u64;
        }
    }

    let pixel_count = block_w as u64 * block_h as u64;
    let ratio = total_diff as f64 / (pixel_count * 255 * 4) as f64;
    ratio > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; (width * height * 4) as usize]
    }

    fn tracker(width: u32, height: u32) -> (DirtyRegionTracker, Vec<u8>) {
        let mut t = DirtyRegionTracker::new(0, TrackerOptions::default());
        let first = solid_frame(width, height, 0);
        let regions = t.track(&first, width, height, (width * 4) as usize);
        assert_eq!(regions.len(), 1);
        (t, first)
    }

    #[test]
    fn test_first_frame_reports_full_frame() {
        let mut t = DirtyRegionTracker::new(3, TrackerOptions::default());
        let frame = solid_frame(640, 480, 0);
        let regions = t.track(&frame, 640, 480, 640 * 4);

        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert_eq!((r.x, r.y, r.width, r.height), (0, 0, 640, 480));
        assert_eq!(r.monitor_id, 3);
    }

    #[test]
    fn test_identical_frames_emit_nothing() {
        let (mut t, frame) = tracker(640, 480);
        let regions = t.track(&frame, 640, 480, 640 * 4);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_single_block_change_emits_one_containing_rect() {
        let (mut t, mut frame) = tracker(640, 480);

        // Flip one 32x32 block at (96, 64) to white.
        for row in 64..96usize {
            for col in 96..128usize {
                let off = (row * 640 + col) * 4;
                frame[off..off + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }

        let regions = t.track(&frame, 640, 480, 640 * 4);
        assert_eq!(regions.len(), 1);
        let r = &regions[0];
        assert!(r.x <= 96 && r.y <= 64);
        assert!(r.right() >= 128 && r.bottom() >= 96);
    }

    #[test]
    fn test_regions_stay_in_bounds() {
        // 100x70 leaves clipped 4x6 edge blocks.
        let mut t = DirtyRegionTracker::new(
            0,
            TrackerOptions {
                min_width: 1,
                min_height: 1,
                ..Default::default()
            },
        );
        let first = solid_frame(100, 70, 0);
        t.track(&first, 100, 70, 400);
        let second = solid_frame(100, 70, 255);
        let regions = t.track(&second, 100, 70, 400);

        assert!(!regions.is_empty());
        for r in &regions {
            assert!(r.x >= 0 && r.y >= 0);
            assert!(r.right() <= 100 && r.bottom() <= 70);
        }
    }

    #[test]
    fn test_dimension_change_reinitialises() {
        let (mut t, _) = tracker(640, 480);
        let other = solid_frame(800, 600, 0);
        let regions = t.track(&other, 800, 600, 800 * 4);

        assert_eq!(regions.len(), 1);
        assert_eq!((regions[0].width, regions[0].height), (800, 600));
    }

    #[test]
    fn test_adjacent_blocks_merge() {
        let (mut t, mut frame) = tracker(640, 480);

        // Two horizontally adjacent blocks.
        for row in 0..32usize {
            for col in 0..64usize {
                let off = (row * 640 + col) * 4;
                frame[off..off + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }

        let regions = t.track(&frame, 640, 480, 640 * 4);
        assert_eq!(regions.len(), 1);
        assert!(regions[0].merged);
        assert_eq!(
            (regions[0].x, regions[0].y, regions[0].width, regions[0].height),
            (0, 0, 64, 32)
        );
    }

    #[test]
    fn test_region_cap_truncates() {
        let mut t = DirtyRegionTracker::new(
            0,
            TrackerOptions {
                merge_enabled: false,
                max_region_count: 4,
                ..Default::default()
            },
        );
        let first = solid_frame(640, 480, 0);
        t.track(&first, 640, 480, 640 * 4);
        let second = solid_frame(640, 480, 255);
        let regions = t.track(&second, 640, 480, 640 * 4);

        assert_eq!(regions.len(), 4);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let rects = vec![
            DirtyRect::new(0, 0, 32, 32, 0),
            DirtyRect::new(32, 0, 32, 32, 0),
            DirtyRect::new(200, 200, 32, 32, 0),
            DirtyRect::new(232, 216, 32, 32, 0),
        ];

        let merged = merge_regions(rects);
        let again = merge_regions(merged.clone());
        assert_eq!(merged, again);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let rects = vec![
            DirtyRect::new(0, 0, 32, 32, 0),
            DirtyRect::new(64, 0, 32, 32, 0),
            DirtyRect::new(32, 0, 32, 32, 0),
            DirtyRect::new(500, 500, 16, 16, 0),
        ];

        let forward = merge_regions(rects.clone());
        let mut reversed = rects;
        reversed.reverse();
        let backward = merge_regions(reversed);

        let key = |r: &DirtyRect| (r.x, r.y, r.width, r.height);
        let mut a: Vec<_> = forward.iter().map(key).collect();
        let mut b: Vec<_> = backward.iter().map(key).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_merged_regions_never_overlap() {
        let rects = vec![
            DirtyRect::new(0, 0, 64, 64, 0),
            DirtyRect::new(32, 32, 64, 64, 0),
            DirtyRect::new(80, 0, 40, 40, 0),
            DirtyRect::new(300, 300, 32, 32, 0),
        ];

        let merged = merge_regions(rects);
        for i in 0..merged.len() {
            for j in i + 1..merged.len() {
                assert!(
                    !merged[i].overlaps(&merged[j]),
                    "{:?} overlaps {:?}",
                    merged[i],
                    merged[j]
                );
            }
        }
    }

    #[test]
    fn test_counters_accumulate() {
        let (mut t, frame) = tracker(640, 480);
        t.track(&frame, 640, 480, 640 * 4);
        let stats = t.stats();
        assert_eq!(stats.pixels_compared, 640 * 480);
        assert_eq!(stats.regions_emitted, 1);
        assert!(stats.last_detection.is_some());
    }
}
