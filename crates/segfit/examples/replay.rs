use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    process,
    ptr::{self, NonNull},
};

use argh::FromArgs;
use segfit::{
    ArenaSource, INITIAL_HEAP_SIZE, SegFitHeap,
    log::{self, LevelFormat, LogLevel},
};
use snafu::{OptionExt as _, ResultExt as _, Whatever, ensure_whatever, whatever};

/// Replay allocation traces against a segregated-fit heap.
#[derive(Debug, FromArgs)]
struct Args {
    #[argh(positional)]
    trace_path: Vec<PathBuf>,
    /// bytes of memory backing the heap region
    #[argh(option, default = "16 * 1024 * 1024")]
    arena_size: usize,
    /// bytes the region starts with
    #[argh(option, default = "INITIAL_HEAP_SIZE")]
    initial_size: usize,
    /// verify heap invariants after every operation
    #[argh(switch)]
    check: bool,
    /// print allocator log records to stderr
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn stderr_sink(level: LogLevel, message: fmt::Arguments<'_>) {
    eprintln!("[{}] {message}", LevelFormat(level));
}

fn main() {
    let args: Args = argh::from_env();

    if args.verbose {
        log::set_logger(stderr_sink);
        log::set_max_level(LogLevel::Trace);
    }

    if let Err(err) = run(&args) {
        let report = snafu::Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Whatever> {
    for trace_path in &args.trace_path {
        replay_trace(args, trace_path).with_whatever_context(|_| {
            format!("failed to replay trace, path={}", trace_path.display())
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Allocate { id: usize, size: usize },
    Release { id: usize },
    Reallocate { id: usize, size: usize },
}

fn parse_line(line: &str) -> Result<Option<Op>, Whatever> {
    let line = line.split('#').next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut fields = line.split_whitespace();
    let kind = fields.next().whatever_context("missing operation")?;
    let mut number = |name: &str| -> Result<usize, Whatever> {
        fields
            .next()
            .with_whatever_context(|| format!("missing {name}"))?
            .parse()
            .with_whatever_context(|_| format!("invalid {name}"))
    };
    let op = match kind {
        "a" => Op::Allocate {
            id: number("id")?,
            size: number("size")?,
        },
        "f" => Op::Release { id: number("id")? },
        "r" => Op::Reallocate {
            id: number("id")?,
            size: number("size")?,
        },
        _ => whatever!("unknown operation {kind:?}"),
    };
    ensure_whatever!(fields.next().is_none(), "trailing fields");
    Ok(Some(op))
}

#[derive(Debug, Default)]
struct Usage {
    live_payload: usize,
    peak_payload: usize,
    operations: usize,
}

impl Usage {
    fn add(&mut self, size: usize) {
        self.live_payload += size;
        self.peak_payload = self.peak_payload.max(self.live_payload);
    }

    fn remove(&mut self, size: usize) {
        self.live_payload -= size;
    }
}

fn replay_trace(args: &Args, path: &Path) -> Result<(), Whatever> {
    let text = fs::read_to_string(path).whatever_context("failed to read trace")?;
    let ops = text
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            parse_line(line)
                .with_whatever_context(|_| format!("invalid trace line, line={}", i + 1))
                .transpose()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut memory = vec![0_u8; args.arena_size];
    let source = ArenaSource::new(&mut memory);
    let mut heap = SegFitHeap::with_initial_size(source, args.initial_size)
        .whatever_context("failed to create heap")?;

    let mut live: HashMap<usize, (NonNull<u8>, usize)> = HashMap::new();
    let mut usage = Usage::default();

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::Allocate { id, size } => {
                ensure_whatever!(!live.contains_key(&id), "id {id} allocated twice");
                if let Some(ptr) = allocate(&mut heap, id, size)? {
                    live.insert(id, (ptr, size));
                    usage.add(size);
                }
            }
            Op::Release { id } => {
                if let Some((ptr, size)) = live.remove(&id) {
                    unsafe { heap.release(ptr.as_ptr()) };
                    usage.remove(size);
                }
            }
            Op::Reallocate { id, size } => {
                let old = live.remove(&id);
                let new = allocate(&mut heap, id, size)?;
                if let Some((old_ptr, old_size)) = old {
                    if let Some(new_ptr) = new {
                        unsafe {
                            ptr::copy_nonoverlapping(
                                old_ptr.as_ptr(),
                                new_ptr.as_ptr(),
                                old_size.min(size),
                            );
                        }
                    }
                    unsafe { heap.release(old_ptr.as_ptr()) };
                    usage.remove(old_size);
                }
                if let Some(new_ptr) = new {
                    live.insert(id, (new_ptr, size));
                    usage.add(size);
                }
            }
        }
        usage.operations += 1;

        if args.check {
            heap.check()
                .with_whatever_context(|_| format!("heap check failed, step={step}, op={op:?}"))?;
        }
    }

    let stats = heap.check().whatever_context("final heap check failed")?;
    #[expect(clippy::cast_precision_loss)]
    let utilization = usage.peak_payload as f64 / stats.region_size as f64 * 100.0;

    println!("Trace: {}", path.display());
    println!("  operations:     {}", usage.operations);
    println!("  peak payload:   {}", usage.peak_payload);
    println!("  region size:    {}", stats.region_size);
    println!("  utilization:    {utilization:.1}%");
    println!(
        "  blocks at exit: {} allocated, {} free (largest {})",
        stats.allocated_block_count, stats.free_block_count, stats.largest_free_block
    );

    Ok(())
}

fn allocate<S>(
    heap: &mut SegFitHeap<S>,
    id: usize,
    size: usize,
) -> Result<Option<NonNull<u8>>, Whatever>
where
    S: segfit::RegionSource,
{
    if size == 0 {
        return Ok(None);
    }
    let ptr = heap
        .allocate(size)
        .with_whatever_context(|| format!("out of memory, id={id}, size={size}"))?;
    // fill the payload so overlapping blocks show up as check failures
    unsafe { ptr.as_ptr().write_bytes(id.to_le_bytes()[0], size) };
    Ok(Some(ptr))
}
