use std::sync::Arc;

use hala_heapprof::{
    BacktraceProvider, ProfiledAlloc, Profiler, ProfilerConfig, ProfilerError, StatisticKey,
};

static PROFILER: Profiler = Profiler::new();

#[global_allocator]
static ALLOC: ProfiledAlloc = ProfiledAlloc::new(&PROFILER);

// The profiler is process-wide, so the whole lifecycle runs in one test.
#[test]
fn profile_global_allocator() {
    _ = pretty_env_logger::try_init();

    assert!(!PROFILER.is_attached());

    let config = ProfilerConfig::default().with_max_frames(16);

    PROFILER
        .start(config, Arc::new(BacktraceProvider::new()))
        .unwrap();

    assert_eq!(
        PROFILER.start(config, Arc::new(BacktraceProvider::new())),
        Err(ProfilerError::AlreadyRunning)
    );

    // every allocation is recorded with sample rate 0.
    let buf: Vec<u8> = Vec::with_capacity(4096);
    let addr = buf.as_ptr() as usize;

    assert_eq!(PROFILER.size_of(addr), 4096);
    assert!(PROFILER.snapshot().contains(&addr));

    let trace = PROFILER.trace(addr).unwrap();
    assert!(!trace.is_empty());
    assert!(trace.len() <= 16);

    let (current, peak) = PROFILER.traced_memory();
    assert!(current >= 4096);
    assert!(peak >= current);

    // growing reports the block under its new address and size.
    let mut grown: Vec<u8> = Vec::with_capacity(16);
    grown.reserve_exact(8192);
    assert_eq!(PROFILER.size_of(grown.as_ptr() as usize), grown.capacity());

    let snapshot = PROFILER.take_snapshot();
    let block = snapshot
        .blocks()
        .iter()
        .find(|block| block.address == addr)
        .expect("missing 4096 byte block");
    assert_eq!(block.size, 4096);
    assert!(!block.trace.is_empty());
    assert!(!snapshot
        .statistics(StatisticKey::Traceback, false)
        .unwrap()
        .is_empty());

    let block_total: usize = snapshot.blocks().iter().map(|block| block.size).sum();
    assert_eq!(snapshot.total_memory_traced(), block_total);

    drop(buf);
    assert_eq!(PROFILER.size_of(addr), 0);

    // the dropped block shows up as a shrinking trace.
    let later = PROFILER.take_snapshot();
    let diff = later
        .compare_to(&snapshot, StatisticKey::Traceback, false)
        .unwrap();
    let dropped = diff
        .iter()
        .find(|statistic| statistic.trace == block.trace)
        .map(|statistic| statistic.size_diff);
    assert_eq!(dropped, Some(-4096));

    PROFILER.reset().unwrap();
    assert_eq!(PROFILER.peak_memory_traced(), 0);
    assert_eq!(PROFILER.size_of(grown.as_ptr() as usize), 0);

    // concurrent allocator traffic while attached.
    let lens: Vec<usize> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let mut strings = vec![];

                    for i in 0..1_000 {
                        strings.push(format!("hello world {i}"));

                        if i % 3 == 0 {
                            strings.pop();
                        }
                    }

                    strings.len()
                })
            })
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .collect()
    });

    assert_eq!(lens, vec![666; 4]);
    assert!(PROFILER.peak_memory_traced() >= PROFILER.total_memory_traced());

    PROFILER.stop();
    assert!(!PROFILER.is_attached());

    // the snapshot owns its traces.
    assert_eq!(block.size, 4096);

    // detached: events are ignored.
    let after: Vec<u8> = Vec::with_capacity(1024);
    assert_eq!(PROFILER.size_of(after.as_ptr() as usize), 0);
    assert_eq!(PROFILER.trace(0), Err(ProfilerError::NotAttached));
}
