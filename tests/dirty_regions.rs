//! Dirty-region tracking and merge properties

use station_capture::*;

fn frame(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; (width * height * 4) as usize]
}

fn primed_tracker(width: u32, height: u32) -> (DirtyRegionTracker, Vec<u8>) {
    let mut tracker = DirtyRegionTracker::new(0, TrackerOptions::default());
    let first = frame(width, height, 0);
    tracker.track(&first, width, height, (width * 4) as usize);
    (tracker, first)
}

#[test]
fn test_regions_always_within_frame_bounds() {
    println!("🎯 Every emitted rectangle lies within the frame...");

    // Odd sizes exercise clipped edge blocks.
    let cases = [(1920u32, 1080u32), (1366, 768), (100, 70), (33, 33)];

    for (width, height) in cases {
        let mut tracker = DirtyRegionTracker::new(
            0,
            TrackerOptions {
                min_width: 1,
                min_height: 1,
                max_region_count: 10_000,
                ..Default::default()
            },
        );
        let first = frame(width, height, 0);
        tracker.track(&first, width, height, (width * 4) as usize);

        let changed = frame(width, height, 200);
        let regions = tracker.track(&changed, width, height, (width * 4) as usize);

        assert!(!regions.is_empty(), "{}x{} detected nothing", width, height);
        for r in &regions {
            assert!(r.x >= 0 && r.y >= 0, "{:?} out of bounds", r);
            assert!(
                r.right() <= width as i32 && r.bottom() <= height as i32,
                "{:?} exceeds {}x{}",
                r,
                width,
                height
            );
        }
    }
}

#[test]
fn test_merged_regions_are_pairwise_disjoint() {
    println!("🎯 Merged rectangles never overlap each other...");

    let (mut tracker, mut current) = primed_tracker(640, 480);

    // Scatter changes across several areas, some adjacent.
    let patches = [(0usize, 0usize), (32, 0), (128, 128), (160, 160), (400, 300)];
    for (px, py) in patches {
        for row in py..py + 32 {
            for col in px..px + 32 {
                let off = (row * 640 + col) * 4;
                current[off..off + 4].copy_from_slice(&[255, 128, 64, 255]);
            }
        }
    }

    let regions = tracker.track(&current, 640, 480, 640 * 4);
    assert!(!regions.is_empty());

    for i in 0..regions.len() {
        for j in i + 1..regions.len() {
            assert!(
                !regions[i].overlaps(&regions[j]),
                "{:?} overlaps {:?}",
                regions[i],
                regions[j]
            );
        }
    }
}

#[test]
fn test_identical_frames_emit_no_regions() {
    println!("🎯 An unchanged screen produces no rectangles...");

    let (mut tracker, current) = primed_tracker(1920, 1080);
    for _ in 0..3 {
        let regions = tracker.track(&current, 1920, 1080, 1920 * 4);
        assert!(regions.is_empty());
    }
}

#[test]
fn test_single_block_change_yields_single_containing_region() {
    println!("🎯 One changed 32x32 block emits exactly one rectangle...");

    let (mut tracker, mut current) = primed_tracker(1920, 1080);

    let (bx, by) = (320usize, 416usize);
    for row in by..by + 32 {
        for col in bx..bx + 32 {
            let off = (row * 1920 + col) * 4;
            current[off..off + 4].copy_from_slice(&[0, 0, 255, 255]);
        }
    }

    let regions = tracker.track(&current, 1920, 1080, 1920 * 4);
    assert_eq!(regions.len(), 1);

    let r = &regions[0];
    assert!(r.x as usize <= bx && r.y as usize <= by);
    assert!(r.right() as usize >= bx + 32 && r.bottom() as usize >= by + 32);
}

#[test]
fn test_merge_is_idempotent() {
    println!("🎯 Feeding merge output back in changes nothing...");

    let rects = vec![
        DirtyRect::new(0, 0, 32, 32, 0),
        DirtyRect::new(32, 0, 32, 32, 0),
        DirtyRect::new(31, 33, 32, 32, 0),
        DirtyRect::new(500, 100, 64, 64, 0),
        DirtyRect::new(564, 100, 10, 10, 0),
    ];

    let once = merge_regions(rects);
    let twice = merge_regions(once.clone());
    assert_eq!(once, twice);
}

#[test]
fn test_merge_is_order_independent() {
    println!("🎯 Merge results do not depend on input order...");

    let rects = vec![
        DirtyRect::new(64, 64, 32, 32, 0),
        DirtyRect::new(0, 0, 40, 40, 0),
        DirtyRect::new(40, 40, 30, 30, 0),
        DirtyRect::new(900, 12, 16, 16, 0),
        DirtyRect::new(20, 20, 32, 32, 0),
    ];

    let normalize = |regions: Vec<DirtyRect>| {
        let mut keys: Vec<_> = regions
            .iter()
            .map(|r| (r.x, r.y, r.width, r.height))
            .collect();
        keys.sort();
        keys
    };

    let baseline = normalize(merge_regions(rects.clone()));

    // A handful of deterministic permutations.
    let mut variant = rects.clone();
    variant.reverse();
    assert_eq!(normalize(merge_regions(variant)), baseline);

    let mut variant = rects.clone();
    variant.swap(0, 3);
    variant.swap(1, 4);
    assert_eq!(normalize(merge_regions(variant)), baseline);

    let mut variant = rects;
    variant.rotate_left(2);
    assert_eq!(normalize(merge_regions(variant)), baseline);
}

#[test]
fn test_region_cap_truncates_not_collapses() {
    println!("🎯 Exceeding the cap truncates the list...");

    let mut tracker = DirtyRegionTracker::new(
        0,
        TrackerOptions {
            merge_enabled: false,
            max_region_count: 8,
            ..Default::default()
        },
    );
    let first = frame(1920, 1080, 0);
    tracker.track(&first, 1920, 1080, 1920 * 4);

    let changed = frame(1920, 1080, 255);
    let regions = tracker.track(&changed, 1920, 1080, 1920 * 4);

    assert_eq!(regions.len(), 8);
    // No full-screen collapse: every survivor is still block-sized.
    for r in &regions {
        assert!(r.width <= BLOCK_SIZE && r.height <= BLOCK_SIZE);
    }
}

#[test]
fn test_threshold_gates_detection() {
    println!("🎯 Sub-threshold noise is ignored, gross change is not...");

    let (mut tracker, base) = primed_tracker(640, 480);

    // A one-unit change in a single channel stays under the 2% default.
    let mut noisy = base.clone();
    noisy[0] = noisy[0].wrapping_add(1);
    let regions = tracker.track(&noisy, 640, 480, 640 * 4);
    assert!(regions.is_empty());

    let loud = frame(640, 480, 255);
    let regions = tracker.track(&loud, 640, 480, 640 * 4);
    assert!(!regions.is_empty());
}

#[test]
fn test_cross_monitor_merge_helper() {
    println!("🎯 The coordinator merge helper keeps distinct clusters apart...");

    let rects = vec![
        DirtyRect::new(10, 10, 20, 20, 0),
        DirtyRect::new(30, 10, 20, 20, 1),
        DirtyRect::new(500, 500, 20, 20, 0),
    ];

    let merged = MultiMonitorCapture::merge_dirty_regions(rects);
    assert_eq!(merged.len(), 2);

    let big = merged.iter().find(|r| r.merged).expect("merged cluster");
    assert_eq!((big.x, big.y, big.width, big.height), (10, 10, 40, 20));
}
