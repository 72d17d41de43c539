//! Replays parsed traces against a fresh allocator.

use std::{collections::HashMap, fmt, ptr::NonNull, slice};

use half_fit::{Arena, ArenaStorage, HEADER_SIZE, HalfFit, HeapCheckError, HeapStats};
use log::{debug, info};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::trace::{Command, Step};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Verify the invariants after every step.
    pub check: bool,
    /// Print the bucket table after every step.
    pub dump: bool,
}

#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("line {line}: `{name}` is not allocated"))]
    UnknownName { line: usize, name: String },
    #[snafu(display("line {line}: `{name}` is still allocated"))]
    DuplicateName { line: usize, name: String },
    #[snafu(display("line {line}: payload of `{name}` was overwritten at offset {offset}"))]
    Corrupted {
        line: usize,
        name: String,
        offset: usize,
    },
    #[snafu(display("line {line}: allocator invariant violated"))]
    Check {
        line: usize,
        source: HeapCheckError,
    },
}

/// Outcome counters of a replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub allocations: usize,
    pub failed_allocations: usize,
    pub frees: usize,
}

#[derive(Debug)]
struct Live {
    ptr: NonNull<u8>,
    size: usize,
    fill: u8,
}

pub struct Replayer<'a> {
    heap: HalfFit<'a>,
    /// Named results; `None` records a refused request.
    live: HashMap<String, Option<Live>>,
    options: Options,
    next_fill: u8,
    summary: Summary,
}

impl<'a> Replayer<'a> {
    pub fn new(storage: &'a mut ArenaStorage, options: Options) -> Self {
        Self {
            heap: HalfFit::new(Arena::new(storage)),
            live: HashMap::new(),
            options,
            next_fill: 1,
            summary: Summary::default(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn run(&mut self, steps: &[Step]) -> Result<Summary, ReplayError> {
        for step in steps {
            self.step(step)?;
        }
        Ok(self.summary)
    }

    fn step(&mut self, step: &Step) -> Result<(), ReplayError> {
        let line = step.line;
        match &step.command {
            Command::Alloc { name, size } => self.alloc(line, name, *size)?,
            Command::Free { name } => self.free(line, name)?,
            Command::Dump => println!("{}", BucketTable(&self.heap)),
            Command::Check => {
                self.check(line)?;
                info!("line {line}: check passed");
            }
            Command::Init => {
                self.heap.init();
                self.live.clear();
                info!("line {line}: allocator reset");
            }
        }

        if self.options.check {
            self.check(line)?;
        }
        if self.options.dump && step.command != Command::Dump {
            println!("{}", BucketTable(&self.heap));
        }
        Ok(())
    }

    fn alloc(&mut self, line: usize, name: &str, size: usize) -> Result<(), ReplayError> {
        ensure!(
            !matches!(self.live.get(name), Some(Some(_))),
            DuplicateNameSnafu { line, name }
        );

        let live = match self.heap.try_allocate(size) {
            Ok(ptr) => {
                let fill = self.next_fill;
                self.next_fill = self.next_fill.checked_add(1).unwrap_or(1);
                unsafe { ptr.write_bytes(fill, size) };
                let block = self
                    .heap
                    .arena()
                    .chunk_index_of(unsafe { ptr.sub(HEADER_SIZE) });
                info!("line {line}: alloc {name} ({size} bytes) -> {block}");
                self.summary.allocations += 1;
                Some(Live { ptr, size, fill })
            }
            Err(err) => {
                info!("line {line}: alloc {name} ({size} bytes) -> null ({err})");
                self.summary.failed_allocations += 1;
                None
            }
        };
        self.live.insert(name.to_owned(), live);
        Ok(())
    }

    fn free(&mut self, line: usize, name: &str) -> Result<(), ReplayError> {
        let entry = self.live.remove(name).context(UnknownNameSnafu { line, name })?;
        let Some(live) = entry else {
            debug!("line {line}: free {name}: null, ignored");
            return Ok(());
        };

        let payload = unsafe { slice::from_raw_parts(live.ptr.as_ptr(), live.size) };
        if let Some(offset) = payload.iter().position(|&byte| byte != live.fill) {
            return CorruptedSnafu { line, name, offset }.fail();
        }
        unsafe { self.heap.deallocate(live.ptr) };
        info!("line {line}: free {name}");
        self.summary.frees += 1;
        Ok(())
    }

    fn check(&self, line: usize) -> Result<(), ReplayError> {
        self.heap.check().context(CheckSnafu { line })
    }
}

/// Bucket table of an allocator, one row per size class.
pub struct BucketTable<'h, 'a>(pub &'h HalfFit<'a>);

impl fmt::Display for BucketTable<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bucket  occupied  head   head_size  len")?;
        for bucket in self.0.buckets() {
            let head = bucket
                .head
                .map_or_else(|| "-".to_owned(), |head| head.to_string());
            let head_size = bucket
                .head_size
                .map_or_else(|| "-".to_owned(), |size| size.to_string());
            writeln!(
                f,
                "{:>6}  {:<8}  {head:<5}  {head_size:>9}  {:>3}",
                bucket.index,
                if bucket.occupied { "yes" } else { "no" },
                bucket.len
            )?;
        }
        let stats = self.0.stats();
        write!(
            f,
            "free: {} chunks in {} blocks (largest {}), allocated: {} chunks in {} blocks",
            stats.free_chunks,
            stats.free_blocks,
            stats.largest_free,
            stats.allocated_chunks,
            stats.allocated_blocks
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use half_fit::MAX_CHUNKS;

    use super::*;
    use crate::trace;

    fn with_test_replayer<F>(options: Options, test_fn: F)
    where
        F: FnOnce(&mut Replayer<'_>),
    {
        let mut storage = Box::new(ArenaStorage::new());
        let mut replayer = Replayer::new(&mut storage, options);
        test_fn(&mut replayer);
    }

    fn replay(replayer: &mut Replayer<'_>, input: &str) -> Result<Summary, ReplayError> {
        replayer.run(&trace::parse(input).unwrap())
    }

    #[test]
    fn test_scenarios_trace() {
        let options = Options {
            check: true,
            dump: false,
        };
        with_test_replayer(options, |replayer| {
            let summary = replay(replayer, include_str!("../traces/scenarios.trace")).unwrap();
            assert_eq!(
                summary,
                Summary {
                    allocations: 1 + 32 + 2 + 3 + 1,
                    failed_allocations: 3,
                    frees: 1 + 2 + 3 + 1,
                }
            );
            let stats = replayer.stats();
            assert_eq!(stats.free_chunks, MAX_CHUNKS);
            assert_eq!(stats.free_blocks, 1);
        });
    }

    #[test]
    fn test_free_of_refused_request_is_ignored() {
        with_test_replayer(Options::default(), |replayer| {
            let summary = replay(replayer, "alloc big 99999\nfree big\n").unwrap();
            assert_eq!(summary.failed_allocations, 1);
            assert_eq!(summary.frees, 0);
        });
    }

    #[test]
    fn test_unknown_name() {
        with_test_replayer(Options::default(), |replayer| {
            let err = replay(replayer, "alloc a 10\nfree b\n").unwrap_err();
            assert!(matches!(err, ReplayError::UnknownName { line: 2, .. }));
        });
    }

    #[test]
    fn test_double_free_is_unknown_name() {
        with_test_replayer(Options::default(), |replayer| {
            let err = replay(replayer, "alloc a 10\nfree a\nfree a\n").unwrap_err();
            assert!(matches!(err, ReplayError::UnknownName { line: 3, .. }));
        });
    }

    #[test]
    fn test_duplicate_name() {
        with_test_replayer(Options::default(), |replayer| {
            let err = replay(replayer, "alloc a 10\nalloc a 20\n").unwrap_err();
            assert!(matches!(err, ReplayError::DuplicateName { line: 2, .. }));
        });
    }

    #[test]
    fn test_init_forgets_allocations() {
        with_test_replayer(Options::default(), |replayer| {
            let err = replay(replayer, "alloc a 10\ninit\nfree a\n").unwrap_err();
            assert!(matches!(err, ReplayError::UnknownName { line: 3, .. }));
            assert_eq!(replayer.stats().free_chunks, MAX_CHUNKS);
        });
    }

    #[test]
    fn test_detects_overwritten_payload() {
        with_test_replayer(Options::default(), |replayer| {
            replay(replayer, "alloc a 64\n").unwrap();
            let live = replayer.live["a"].as_ref().unwrap();
            unsafe { live.ptr.add(10).write(0) };

            let err = replay(replayer, "free a\n").unwrap_err();
            assert!(matches!(
                err,
                ReplayError::Corrupted {
                    line: 1,
                    offset: 10,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_bucket_table() {
        let mut storage = Box::new(ArenaStorage::new());
        let mut heap = HalfFit::new(Arena::new(&mut storage));
        let _ptr = heap.allocate(100).unwrap();

        let table = BucketTable(&heap).to_string();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 1 + 11 + 1);
        assert_eq!(lines[0], "bucket  occupied  head   head_size  len");
        assert_eq!(lines[10], "     9  yes       #4          1020    1");
        assert_eq!(lines[11], "    10  no        -              -    0");
        assert_eq!(
            lines[12],
            "free: 1020 chunks in 1 blocks (largest 1020), allocated: 4 chunks in 1 blocks"
        );
    }
}
