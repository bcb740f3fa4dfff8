use std::{collections::HashMap, sync::Arc};

use clap::{Parser, ValueEnum};
use hala_heapprof::{
    BacktraceProvider, Filter, ProfiledAlloc, Profiler, ProfilerConfig, StatisticKey,
};

static PROFILER: Profiler = Profiler::new();

#[global_allocator]
static ALLOC: ProfiledAlloc = ProfiledAlloc::new(&PROFILER);

/// Run an allocation workload under the sampling heap profiler and print the
/// largest live allocation sites.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Options {
    /// Maximum number of frames captured per allocation, at most 128.
    #[arg(long, env = "HEAPPROF_MAX_FRAMES", default_value_t = 32)]
    max_frames: usize,

    /// Mean number of bytes between two samples, 0 records every allocation.
    #[arg(long, env = "HEAPPROF_SAMPLE_RATE", default_value_t = 64 * 1024)]
    sample_rate: u64,

    /// Number of worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Allocations performed by each worker.
    #[arg(long, default_value_t = 100_000)]
    iterations: usize,

    /// Number of allocation sites to print.
    #[arg(long, default_value_t = 5)]
    top: usize,

    /// How allocation sites are grouped.
    #[arg(long, value_enum, default_value_t = GroupBy::Traceback)]
    group_by: GroupBy,

    /// Count a block for every frame of its trace, not only the innermost.
    #[arg(long)]
    cumulative: bool,

    /// Drop blocks allocated from files matching this pattern, `*` is a wildcard.
    #[arg(long)]
    exclude: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GroupBy {
    Traceback,
    Filename,
    Lineno,
}

impl From<GroupBy> for StatisticKey {
    fn from(value: GroupBy) -> Self {
        match value {
            GroupBy::Traceback => StatisticKey::Traceback,
            GroupBy::Filename => StatisticKey::Filename,
            GroupBy::Lineno => StatisticKey::Lineno,
        }
    }
}

fn main() {
    pretty_env_logger::init();

    let options = Options::parse();

    let config = ProfilerConfig::default()
        .with_max_frames(options.max_frames)
        .with_sample_rate(options.sample_rate);

    let filters = match options
        .exclude
        .iter()
        .map(|pattern| Filter::new(false, pattern.as_str()).map(|f| f.with_all_frames(true)))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(filters) => filters,
        Err(err) => {
            log::error!("invalid --exclude pattern: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = PROFILER.start(config, Arc::new(BacktraceProvider::new())) {
        log::error!("failed to start heap profiler: {}", err);
        std::process::exit(1);
    }

    let retained = run_workload(options.threads, options.iterations);

    let snapshot = PROFILER.take_snapshot().filter_traces(&filters);

    let statistics = match snapshot.statistics(options.group_by.into(), options.cumulative) {
        Ok(statistics) => statistics,
        Err(err) => {
            log::error!("failed to group allocations: {}", err);
            std::process::exit(1);
        }
    };

    println!(
        "live sampled blocks: {}, traced: {}B, peak: {}B, profiler overhead: {}B",
        snapshot.blocks().len(),
        snapshot.total_memory_traced(),
        snapshot.peak_memory_traced(),
        PROFILER.memory_usage(),
    );

    for (rank, statistic) in statistics.iter().take(options.top).enumerate() {
        println!(
            "#{} {} bytes in {} blocks",
            rank + 1,
            statistic.size,
            statistic.count
        );

        if statistic.trace.is_empty() {
            println!("    <unknown>");
        }

        for frame in statistic.trace.iter() {
            println!("    {}", frame);
        }
    }

    PROFILER.stop();

    log::info!("workload retained {} entries", retained);
}

/// Each worker keeps a growing map of strings and vectors, dropping a third of
/// what it creates.
fn run_workload(threads: usize, iterations: usize) -> usize {
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|worker| scope.spawn(move || fill_cache(worker, iterations)))
            .collect();

        workers
            .into_iter()
            .map(|worker| worker.join().map(|cache| cache.len()).unwrap_or_default())
            .sum()
    })
}

fn fill_cache(worker: usize, iterations: usize) -> HashMap<String, Vec<u64>> {
    let mut cache = HashMap::new();

    for i in 0..iterations {
        let key = format!("worker-{worker}-entry-{i}");
        let value = (0..(i % 64) as u64).collect::<Vec<_>>();

        cache.insert(key, value);

        if i % 3 == 0 {
            cache.remove(&format!("worker-{worker}-entry-{}", i / 2));
        }
    }

    cache
}
