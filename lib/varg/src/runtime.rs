//! Job drivers: parallel map fan-out, the map/reduce barrier, and the
//! parallel reduce phase.
//!
//! Both drivers launch one task per `(source, partition)` pair on the
//! rayon pool and run every task to completion even when some fail; the
//! job result is the last task error observed. Mappers ending a
//! partition early return [`MapFlow::Stop`], which terminates the record
//! loop as a success and still runs `map_end`.

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::api::{
    CollectCloser, Input, MapFlow, MapperFactory, OnlyMapperFactory, Output, ReducerFactory,
};
use crate::error::{Error, Result};
use crate::sorters::{MemSorter, Sorter};

/// A job with a mapping step only: records flow from each input
/// partition straight to one collector per destination.
pub struct MapOnlyJob {
    /// The input sources.
    pub source: Vec<Box<dyn Input>>,
    /// Factory invoked once per `(source, partition)` task.
    pub new_mapper: Option<OnlyMapperFactory>,
    /// The output destinations. Each task opens one collector per
    /// destination, indexed by the task's global partition.
    pub dest: Vec<Box<dyn Output>>,
}

impl MapOnlyJob {
    pub fn run(&self) -> Result<()> {
        let new_mapper = self
            .new_mapper
            .as_ref()
            .ok_or_else(|| Error::Config("map-only job: mapper factory undefined".into()))?;
        if self.source.is_empty() {
            return Err(Error::Config("map-only job: source undefined".into()));
        }

        let tasks = plan_tasks(&self.source)?;
        info!(sources = self.source.len(), tasks = tasks.len(), "map-only job starting");
        let started = Instant::now();

        let results: Vec<Result<()>> = tasks
            .par_iter()
            .map(|t| {
                let res = self.run_task(new_mapper, t);
                if let Err(e) = &res {
                    debug!(src = t.src, part = t.part, error = %e, "map task failed");
                }
                res
            })
            .collect();

        let res = last_err(results);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = res.is_ok(),
            "map-only job finished"
        );
        res
    }

    fn run_task(&self, new_mapper: &OnlyMapperFactory, t: &MapTask) -> Result<()> {
        let mut mapper = new_mapper(t.src, t.part);
        let mut key = mapper.new_key();
        let mut val = mapper.new_val();

        let mut cs: Vec<Box<dyn CollectCloser>> = Vec::with_capacity(self.dest.len());
        for dst in &self.dest {
            match dst.collector(t.global) {
                Ok(c) => cs.push(c),
                Err(e) => {
                    let _ = close_collectors(&mut cs);
                    return Err(e);
                }
            }
        }
        let mut iter = match self.source[t.src].iterator(t.part) {
            Ok(it) => it,
            Err(e) => {
                let _ = close_collectors(&mut cs);
                return Err(e);
            }
        };

        let res = (|| {
            loop {
                if !iter.next(&mut *key, &mut *val)? {
                    break;
                }
                match mapper.map(&*key, &*val, &mut cs)? {
                    MapFlow::Continue => {}
                    MapFlow::Stop => {
                        debug!(src = t.src, part = t.part, "mapper stopped its partition early");
                        break;
                    }
                }
            }
            mapper.map_end(&mut cs)
        })();

        let iter_closed = iter.close();
        let collectors_closed = close_collectors(&mut cs);
        res.and(iter_closed).and(collectors_closed)
    }
}

/// A job with a mapping and a reducing step: mapped pairs are routed to
/// output partitions through the sorter, sorted by encoded key, and
/// reduced per key group.
pub struct MrJob {
    /// The input sources.
    pub source: Vec<Box<dyn Input>>,
    /// Factory invoked once per `(source, partition)` map task.
    pub new_mapper: Option<MapperFactory>,
    /// Factory invoked once per output partition reduce task.
    pub new_reducer: Option<ReducerFactory>,
    /// Shuffle strategy. [`MemSorter`] when unset.
    pub sorter: Option<Box<dyn Sorter>>,
    /// The output destinations.
    pub dest: Vec<Box<dyn Output>>,
}

impl MrJob {
    pub fn run(&self) -> Result<()> {
        let new_mapper = self
            .new_mapper
            .as_ref()
            .ok_or_else(|| Error::Config("mr job: mapper factory undefined".into()))?;
        let new_reducer = self
            .new_reducer
            .as_ref()
            .ok_or_else(|| Error::Config("mr job: reducer factory undefined".into()))?;
        if self.source.is_empty() {
            return Err(Error::Config("mr job: source undefined".into()));
        }

        let default_sorter;
        let sorter: &dyn Sorter = match &self.sorter {
            Some(s) => &**s,
            None => {
                info!("sorter not specified, using MemSorter");
                default_sorter = MemSorter::new();
                &default_sorter
            }
        };

        /*
         * Map
         */
        let tasks = plan_tasks(&self.source)?;
        info!(sources = self.source.len(), tasks = tasks.len(), "map phase starting");
        let started = Instant::now();

        let results: Vec<Result<()>> = tasks
            .par_iter()
            .map(|t| {
                let res = self.run_map_task(sorter, new_mapper, t);
                if let Err(e) = &res {
                    debug!(src = t.src, part = t.part, error = %e, "map task failed");
                }
                res
            })
            .collect();
        let mut map_res = last_err(results);

        // barrier: every mapper has joined; seal the intermediate store
        // even when the phase failed so spill writers are flushed
        let sealed = sorter.close_part_collectors();
        if map_res.is_ok() {
            map_res = sealed;
        }
        map_res?;
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "map phase done");

        /*
         * Reduce
         */
        let parts = sorter.reduce_parts();
        info!(parts = parts.len(), "reduce phase starting");
        let started = Instant::now();

        let results: Vec<Result<()>> = parts
            .par_iter()
            .map(|&part| {
                let res = self.run_reduce_task(sorter, new_reducer, part);
                if let Err(e) = &res {
                    debug!(part, error = %e, "reduce task failed");
                }
                res
            })
            .collect();

        let res = last_err(results);
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = res.is_ok(),
            "reduce phase done"
        );
        res
    }

    fn run_map_task(&self, sorter: &dyn Sorter, new_mapper: &MapperFactory, t: &MapTask) -> Result<()> {
        let c = sorter.new_part_collector(t.global)?;
        let mut mapper = new_mapper(t.src, t.part);
        let mut key = mapper.new_key();
        let mut val = mapper.new_val();
        let mut iter = self.source[t.src].iterator(t.part)?;

        let res = (|| {
            loop {
                if !iter.next(&mut *key, &mut *val)? {
                    break;
                }
                match mapper.map(&*key, &*val, &*c)? {
                    MapFlow::Continue => {}
                    MapFlow::Stop => {
                        debug!(src = t.src, part = t.part, "mapper stopped its partition early");
                        break;
                    }
                }
            }
            mapper.map_end(&*c)
        })();

        let iter_closed = iter.close();
        res.and(iter_closed)
    }

    fn run_reduce_task(
        &self,
        sorter: &dyn Sorter,
        new_reducer: &ReducerFactory,
        part: usize,
    ) -> Result<()> {
        let mut it = sorter.new_reduce_iterator(part)?;

        let mut cs: Vec<Box<dyn CollectCloser>> = Vec::with_capacity(self.dest.len());
        for dst in &self.dest {
            match dst.collector(part) {
                Ok(c) => cs.push(c),
                Err(e) => {
                    let _ = close_collectors(&mut cs);
                    return Err(e);
                }
            }
        }

        let mut reducer = new_reducer(part);
        let res = it.iterate(&mut cs, reducer.as_mut());
        let collectors_closed = close_collectors(&mut cs);
        res.and(collectors_closed)
    }
}

/// One map task: input partition `part` of source `src`, globally
/// numbered `global` across all sources.
struct MapTask {
    src: usize,
    part: usize,
    global: usize,
}

fn plan_tasks(source: &[Box<dyn Input>]) -> Result<Vec<MapTask>> {
    let mut tasks = Vec::new();
    let mut global = 0;
    for (src, input) in source.iter().enumerate() {
        let parts = input.part_count()?;
        for part in 0..parts {
            tasks.push(MapTask { src, part, global });
            global += 1;
        }
    }
    Ok(tasks)
}

fn last_err(results: Vec<Result<()>>) -> Result<()> {
    let mut out = Ok(());
    for r in results {
        if r.is_err() {
            out = r;
        }
    }
    out
}

/// Closes every collector, keeping the last failure. The vector is
/// emptied so a later pass cannot close twice.
fn close_collectors(cs: &mut Vec<Box<dyn CollectCloser>>) -> Result<()> {
    let mut out = Ok(());
    for c in cs.iter_mut() {
        if let Err(e) = c.close() {
            out = Err(e);
        }
    }
    cs.clear();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Collector, IterateCloser, Mapper, PartCollector, Reducer, SvIter};
    use crate::codec::{Null, RawStr, RawVInt, Sv, VInt};
    use crate::dirio::{DirInput, DirOutput};
    use crate::error::Error;
    use crate::fs::FsPath;
    use crate::kvfile::KvWriter;
    use crate::sorters::FileSorter;
    use crate::utils::{FnCollectCloser, FnInput, FnIterateCloser, FnMapper, FnOnlyMapper, FnOutput, FnReducer};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    const WORDS: &str = "\
the quick brown fox jumps over the lazy dog
pack my box with five dozen liquor jugs
the five boxing wizards jump quickly
The dog barks and the Fox runs
sphinx of black quartz judge my vow
jugs and jugs of liquor for the sphinx
111";

    /// An in-memory input of one partition whose records are lines
    /// carried in the key slot.
    struct LinesInput(Vec<String>);

    impl Input for LinesInput {
        fn part_count(&self) -> crate::error::Result<usize> {
            Ok(1)
        }

        fn iterator(&self, _part: usize) -> crate::error::Result<Box<dyn IterateCloser>> {
            Ok(Box::new(LinesIter { lines: self.0.clone(), pos: 0 }))
        }
    }

    struct LinesIter {
        lines: Vec<String>,
        pos: usize,
    }

    impl IterateCloser for LinesIter {
        fn next(&mut self, key: &mut dyn Sv, _val: &mut dyn Sv) -> crate::error::Result<bool> {
            if self.pos >= self.lines.len() {
                return Ok(false);
            }
            key.downcast_mut::<RawStr>().expect("RawStr key slot").0 = self.lines[self.pos].clone();
            self.pos += 1;
            Ok(true)
        }

        fn close(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    /// Reference word counter the jobs are checked against.
    fn stat_words(text: &str) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for line in text.lines() {
            for word in line.split(' ').filter(|w| !w.is_empty()) {
                *counts.entry(word.to_lowercase()).or_insert(0) += 1;
            }
        }
        counts
    }

    struct WordCountMapper;

    impl Mapper for WordCountMapper {
        fn new_key(&self) -> Box<dyn Sv> {
            Box::new(RawStr::default())
        }

        fn new_val(&self) -> Box<dyn Sv> {
            Box::new(Null)
        }

        fn map(
            &mut self,
            key: &dyn Sv,
            _val: &dyn Sv,
            c: &dyn PartCollector,
        ) -> crate::error::Result<MapFlow> {
            let line = &key.downcast_ref::<RawStr>().expect("RawStr key").0;
            for word in line.split(' ').filter(|w| !w.is_empty()) {
                let word = word.to_lowercase();
                let part = word.as_bytes()[0] as usize;
                c.collect_to(part, &RawStr(word), &RawVInt(1))?;
            }
            Ok(MapFlow::Continue)
        }
    }

    /// Sums `RawVInt` counts per word and collects the totals to the
    /// first destination.
    struct WordCountReducer;

    impl Reducer for WordCountReducer {
        fn new_key(&self) -> Box<dyn Sv> {
            Box::new(RawStr::default())
        }

        fn new_val(&self) -> Box<dyn Sv> {
            Box::new(RawVInt(0))
        }

        fn reduce(
            &mut self,
            key: &dyn Sv,
            vals: &mut dyn SvIter,
            c: &mut [Box<dyn CollectCloser>],
        ) -> crate::error::Result<()> {
            let mut count = 0u64;
            while let Some(val) = vals.next()? {
                count += val.downcast_ref::<RawVInt>().expect("RawVInt val").0;
            }
            c[0].collect(key, &RawVInt(count))
        }
    }

    /// An output capturing word counts into a shared map.
    fn counting_output(counts: Arc<Mutex<HashMap<String, u64>>>) -> FnOutput {
        FnOutput {
            collector: Some(Box::new(move |_part| {
                let counts = Arc::clone(&counts);
                Ok(Box::new(FnCollectCloser {
                    collect: Some(Box::new(move |key, val| {
                        let word = key.downcast_ref::<RawStr>().expect("RawStr key").0.clone();
                        let n = val.downcast_ref::<RawVInt>().expect("RawVInt val").0;
                        counts.lock().unwrap().insert(word, n);
                        Ok(())
                    })),
                    close: None,
                }))
            })),
        }
    }

    #[test]
    fn map_only_counts_every_record() {
        let collected = Arc::new(AtomicUsize::new(0));
        let line_count = lines(WORDS).len();

        let job = MapOnlyJob {
            source: vec![Box::new(LinesInput(lines(WORDS)))],
            new_mapper: Some(Box::new(|_src, _part| {
                Box::new(FnOnlyMapper {
                    new_key: Some(Box::new(|| Box::new(RawStr::default()))),
                    new_val: Some(Box::new(|| Box::new(Null))),
                    map: Some(Box::new(|_key, _val, c| {
                        c[0].collect(&VInt(1), &Null)?;
                        Ok(MapFlow::Continue)
                    })),
                    map_end: None,
                })
            })),
            dest: vec![Box::new(FnOutput {
                collector: Some(Box::new({
                    let collected = Arc::clone(&collected);
                    move |_part| {
                        let collected = Arc::clone(&collected);
                        Ok(Box::new(FnCollectCloser {
                            collect: Some(Box::new(move |_k, _v| {
                                collected.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            })),
                            close: None,
                        }))
                    }
                })),
            })],
        };

        job.run().unwrap();
        assert_eq!(collected.load(Ordering::Relaxed), line_count);
    }

    #[test]
    fn map_only_early_exit_closes_everything() {
        let input_closed = Arc::new(AtomicBool::new(false));
        let collected = Arc::new(AtomicUsize::new(0));
        let collector_closed = Arc::new(AtomicBool::new(false));

        let job = MapOnlyJob {
            source: vec![Box::new(FnInput {
                part_count: Some(Box::new(|| Ok(1))),
                iterator: Some(Box::new({
                    let input_closed = Arc::clone(&input_closed);
                    move |part| {
                        assert_eq!(part, 0);
                        let mut n = 0u64;
                        let input_closed = Arc::clone(&input_closed);
                        Ok(Box::new(FnIterateCloser {
                            next: Some(Box::new(move |key, val| {
                                if n >= 10 {
                                    return Ok(false);
                                }
                                key.downcast_mut::<VInt>().expect("VInt key").0 = n;
                                val.downcast_mut::<RawStr>().expect("RawStr val").0 = n.to_string();
                                n += 1;
                                Ok(true)
                            })),
                            close: Some(Box::new(move || {
                                input_closed.store(true, Ordering::Relaxed);
                                Ok(())
                            })),
                        }))
                    }
                })),
            })],
            new_mapper: Some(Box::new(|_src, _part| {
                let mut n = 0;
                Box::new(FnOnlyMapper {
                    new_key: Some(Box::new(|| Box::new(VInt(0)))),
                    new_val: Some(Box::new(|| Box::new(RawStr::default()))),
                    map: Some(Box::new(move |key, val, c| {
                        c[0].collect(key, val)?;
                        n += 1;
                        if n == 5 {
                            return Ok(MapFlow::Stop);
                        }
                        Ok(MapFlow::Continue)
                    })),
                    map_end: None,
                })
            })),
            dest: vec![Box::new(FnOutput {
                collector: Some(Box::new({
                    let collected = Arc::clone(&collected);
                    let collector_closed = Arc::clone(&collector_closed);
                    move |part| {
                        assert_eq!(part, 0);
                        let collected = Arc::clone(&collected);
                        let collector_closed = Arc::clone(&collector_closed);
                        Ok(Box::new(FnCollectCloser {
                            collect: Some(Box::new(move |_k, _v| {
                                collected.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            })),
                            close: Some(Box::new(move || {
                                collector_closed.store(true, Ordering::Relaxed);
                                Ok(())
                            })),
                        }))
                    }
                })),
            })],
        };

        job.run().unwrap();
        assert!(input_closed.load(Ordering::Relaxed), "input iterator not closed");
        assert_eq!(collected.load(Ordering::Relaxed), 5);
        assert!(collector_closed.load(Ordering::Relaxed), "collector not closed");
    }

    #[test]
    fn map_reduce_word_count_with_default_sorter() {
        let counts = Arc::new(Mutex::new(HashMap::new()));

        let job = MrJob {
            source: vec![Box::new(LinesInput(lines(WORDS)))],
            new_mapper: Some(Box::new(|_src, _part| Box::new(WordCountMapper))),
            new_reducer: Some(Box::new(|_part| Box::new(WordCountReducer))),
            sorter: None,
            dest: vec![Box::new(counting_output(Arc::clone(&counts)))],
        };

        job.run().unwrap();
        assert_eq!(*counts.lock().unwrap(), stat_words(WORDS));
    }

    #[test]
    fn word_count_agrees_across_sorters() {
        // scenario: "a b a" must yield {a: 2, b: 1} with either sorter
        for use_file_sorter in [false, true] {
            let dir = tempdir().unwrap();
            let counts = Arc::new(Mutex::new(HashMap::new()));
            let sorter: Option<Box<dyn Sorter>> = if use_file_sorter {
                Some(Box::new(FileSorter::new(FsPath::local(dir.path().join("tmp")))))
            } else {
                None
            };

            let job = MrJob {
                source: vec![Box::new(LinesInput(vec!["a b a".to_string()]))],
                new_mapper: Some(Box::new(|_src, _part| Box::new(WordCountMapper))),
                new_reducer: Some(Box::new(|_part| Box::new(WordCountReducer))),
                sorter,
                dest: vec![Box::new(counting_output(Arc::clone(&counts)))],
            };
            job.run().unwrap();

            let expected: HashMap<String, u64> =
                [("a".to_string(), 2), ("b".to_string(), 1)].into_iter().collect();
            assert_eq!(*counts.lock().unwrap(), expected, "file sorter: {use_file_sorter}");
        }
    }

    #[test]
    fn map_reduce_from_files_through_file_sorter() {
        let dir = tempdir().unwrap();
        let root = FsPath::local(dir.path());
        let mrin = root.join("mrin");
        mrin.mkdir().unwrap();

        // three lines per input partition
        let all_lines = lines(WORDS);
        for (part, chunk) in all_lines.chunks(3).enumerate() {
            let mut w = KvWriter::create(&mrin.join(format!("part-{part:05}"))).unwrap();
            for line in chunk {
                w.collect(&RawStr(line.clone()), &Null).unwrap();
            }
            w.close().unwrap();
        }

        let mrout = root.join("mrout");
        let job = MrJob {
            source: vec![Box::new(DirInput(mrin))],
            new_mapper: Some(Box::new(|_src, _part| Box::new(WordCountMapper))),
            new_reducer: Some(Box::new(|_part| Box::new(WordCountReducer))),
            sorter: Some(Box::new(FileSorter::new(root.join("tmp")))),
            dest: vec![Box::new(DirOutput(mrout.clone()))],
        };
        job.run().unwrap();

        // read back every output partition
        let result_in = DirInput(mrout);
        let mut word = RawStr::default();
        let mut count = RawVInt(0);
        let mut actual = HashMap::new();
        for part in 0..result_in.part_count().unwrap() {
            let mut iter = result_in.iterator(part).unwrap();
            while iter.next(&mut word, &mut count).unwrap() {
                actual.insert(word.0.clone(), count.0);
            }
            iter.close().unwrap();
        }

        assert_eq!(actual, stat_words(WORDS));
    }

    #[test]
    fn reduce_sees_map_end_emissions_once_per_partition() {
        // two empty partitions; each map_end emits ("part", part). The
        // reducer must see the key once with two distinct values.
        let groups = Arc::new(AtomicUsize::new(0));
        let values_seen = Arc::new(AtomicUsize::new(0));

        let job = MrJob {
            source: vec![Box::new(FnInput {
                part_count: Some(Box::new(|| Ok(2))),
                iterator: None,
            })],
            new_mapper: Some(Box::new(|_src, part| {
                Box::new(FnMapper {
                    map_end: Some(Box::new(move |c| {
                        c.collect_to(0, &RawStr::new("part"), &VInt(part as u64))
                    })),
                    ..FnMapper::default()
                })
            })),
            new_reducer: Some(Box::new({
                let groups = Arc::clone(&groups);
                let values_seen = Arc::clone(&values_seen);
                move |_part| {
                    let groups = Arc::clone(&groups);
                    let values_seen = Arc::clone(&values_seen);
                    let mut seen = Vec::<u64>::new();
                    Box::new(FnReducer {
                        new_key: Some(Box::new(|| Box::new(RawStr::default()))),
                        new_val: Some(Box::new(|| Box::new(VInt(0)))),
                        reduce: Some(Box::new(move |key, vals, _c| {
                            assert_eq!(key.downcast_ref::<RawStr>().expect("RawStr key").0, "part");
                            groups.fetch_add(1, Ordering::Relaxed);
                            while let Some(val) = vals.next()? {
                                let v = val.downcast_ref::<VInt>().expect("VInt val").0;
                                assert!(!seen.contains(&v), "duplicated value {v}");
                                seen.push(v);
                                values_seen.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(())
                        })),
                        ..FnReducer::default()
                    })
                }
            })),
            sorter: None,
            dest: vec![],
        };

        job.run().unwrap();
        assert_eq!(groups.load(Ordering::Relaxed), 1, "one key group expected");
        assert_eq!(values_seen.load(Ordering::Relaxed), 2, "one value per input partition");
    }

    #[test]
    fn preflight_rejects_incomplete_jobs() {
        let job = MapOnlyJob { source: vec![], new_mapper: None, dest: vec![] };
        assert!(matches!(job.run(), Err(Error::Config(_))));

        let job = MapOnlyJob {
            source: vec![],
            new_mapper: Some(Box::new(|_, _| Box::new(FnOnlyMapper::default()))),
            dest: vec![],
        };
        assert!(matches!(job.run(), Err(Error::Config(_))));

        let job = MrJob {
            source: vec![Box::new(FnInput::default())],
            new_mapper: Some(Box::new(|_, _| Box::new(FnMapper::default()))),
            new_reducer: None,
            sorter: None,
            dest: vec![],
        };
        assert!(matches!(job.run(), Err(Error::Config(_))));
    }

    #[test]
    fn map_task_error_fails_the_job() {
        let job = MapOnlyJob {
            source: vec![Box::new(FnInput {
                part_count: Some(Box::new(|| Ok(1))),
                iterator: Some(Box::new(|_part| {
                    Ok(Box::new(FnIterateCloser {
                        next: Some(Box::new(|_k, _v| Err(Error::BadFormat))),
                        close: None,
                    }))
                })),
            })],
            new_mapper: Some(Box::new(|_, _| Box::new(FnOnlyMapper::default()))),
            dest: vec![],
        };
        assert!(matches!(job.run(), Err(Error::BadFormat)));
    }
}
