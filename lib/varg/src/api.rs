//! Capabilities the job drivers are written against.
//!
//! Mappers and reducers hand out reusable key/value slots through their
//! `new_key`/`new_val` factories; the drivers decode every record into the
//! same slots, so user code that needs to retain contents across records
//! must copy them out.

use crate::codec::{RawBytes, Sv};
use crate::error::Result;

/// Returned by a mapper to keep or stop its partition's record loop.
///
/// `Stop` ends the loop as a success: no further `map` calls are made for
/// the partition, but `map_end` still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFlow {
    Continue,
    Stop,
}

/// Accepts key/value pairs routed to one output destination.
pub trait Collector {
    fn collect(&mut self, key: &dyn Sv, val: &dyn Sv) -> Result<()>;
}

/// A [`Collector`] with an explicit close that flushes buffered records.
pub trait CollectCloser: Collector {
    fn close(&mut self) -> Result<()>;
}

/// Yields key/value records into caller-owned slots until exhausted.
pub trait IterateCloser {
    /// Decodes the next record into `key` and `val`. `Ok(false)` is the
    /// clean end of the stream.
    fn next(&mut self, key: &mut dyn Sv, val: &mut dyn Sv) -> Result<bool>;

    fn close(&mut self) -> Result<()>;
}

/// A partitioned source of records.
pub trait Input: Send + Sync {
    fn part_count(&self) -> Result<usize>;

    /// Opens an iterator over partition `part`, in `[0, part_count())`.
    fn iterator(&self, part: usize) -> Result<Box<dyn IterateCloser>>;
}

/// A partitioned destination for records.
pub trait Output: Send + Sync {
    fn collector(&self, part: usize) -> Result<Box<dyn CollectCloser>>;
}

/// A collector that additionally selects the output partition per record.
///
/// Collectors of this kind are shared by concurrently running mappers, so
/// collection goes through `&self` with interior locking.
pub trait PartCollector: Sync {
    fn collect_to(&self, part: usize, key: &dyn Sv, val: &dyn Sv) -> Result<()>;
}

impl<T: PartCollector + ?Sized> PartCollector for &T {
    fn collect_to(&self, part: usize, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        (**self).collect_to(part, key, val)
    }
}

/// The mapping stage of a map-only job: one collector per destination.
pub trait OnlyMapper {
    /// Fresh reusable key slot for reading the source. The default slot
    /// accepts any encoded payload.
    fn new_key(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    /// Maps one record, collecting results to `c` (one collector per
    /// destination, indexed like the job's `dest` list).
    fn map(
        &mut self,
        key: &dyn Sv,
        val: &dyn Sv,
        c: &mut [Box<dyn CollectCloser>],
    ) -> Result<MapFlow>;

    /// Runs once after the partition's record loop ends.
    fn map_end(&mut self, _c: &mut [Box<dyn CollectCloser>]) -> Result<()> {
        Ok(())
    }
}

/// The mapping stage of a map-reduce job: intermediates are routed to
/// output partitions through the sorter's [`PartCollector`].
pub trait Mapper {
    fn new_key(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    fn map(&mut self, key: &dyn Sv, val: &dyn Sv, c: &dyn PartCollector) -> Result<MapFlow>;

    fn map_end(&mut self, _c: &dyn PartCollector) -> Result<()> {
        Ok(())
    }
}

/// Streaming iterator over the values of one key group.
///
/// Each `next` overwrites the reducer's value slot, so the returned
/// reference is only good until the following call.
pub trait SvIter {
    fn next(&mut self) -> Result<Option<&dyn Sv>>;
}

/// The reducing stage of a map-reduce job.
pub trait Reducer {
    fn new_key(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        Box::new(RawBytes::default())
    }

    /// Reduces one key group. `vals` may be left unexhausted; the caller
    /// drains it so the next group starts aligned.
    fn reduce(
        &mut self,
        key: &dyn Sv,
        vals: &mut dyn SvIter,
        c: &mut [Box<dyn CollectCloser>],
    ) -> Result<()>;

    /// Runs once after the partition's final key group.
    fn reduce_end(&mut self, _c: &mut [Box<dyn CollectCloser>]) -> Result<()> {
        Ok(())
    }
}

/// Factory producing one [`OnlyMapper`] per `(source, partition)` task.
pub type OnlyMapperFactory = Box<dyn Fn(usize, usize) -> Box<dyn OnlyMapper> + Send + Sync>;

/// Factory producing one [`Mapper`] per `(source, partition)` task.
pub type MapperFactory = Box<dyn Fn(usize, usize) -> Box<dyn Mapper> + Send + Sync>;

/// Factory producing one [`Reducer`] per output partition.
pub type ReducerFactory = Box<dyn Fn(usize) -> Box<dyn Reducer> + Send + Sync>;
