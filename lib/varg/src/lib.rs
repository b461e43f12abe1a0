//! varg: a single-process MapReduce engine with a compact binary
//! key-value format.
//!
//! A job runs user-supplied map and reduce stages over partitioned
//! inputs, routes intermediate pairs through a pluggable [`Sorter`], and
//! emits results into partitioned outputs — all concurrently within one
//! process. Serialization avoids reflection and reallocation: values
//! implement the [`Sv`] encode/decode pair and decode in place into
//! reused slots.
//!
//! A word count looks like this:
//!
//! ```no_run
//! use varg::{DirInput, DirOutput, FileSorter, FsPath, MrJob};
//! use varg::{MapFlow, Mapper, RawStr, RawVInt, Reducer, SvIter};
//! use varg::api::{CollectCloser, Collector, PartCollector};
//! use varg::codec::{Null, Sv};
//!
//! struct WcMapper;
//!
//! impl Mapper for WcMapper {
//!     fn new_key(&self) -> Box<dyn Sv> { Box::new(RawStr::default()) }
//!     fn new_val(&self) -> Box<dyn Sv> { Box::new(Null) }
//!
//!     fn map(&mut self, key: &dyn Sv, _val: &dyn Sv, c: &dyn PartCollector)
//!         -> varg::Result<MapFlow>
//!     {
//!         let line = &key.downcast_ref::<RawStr>().expect("line key").0;
//!         for word in line.split(' ').filter(|w| !w.is_empty()) {
//!             let word = word.to_lowercase();
//!             c.collect_to(word.as_bytes()[0] as usize, &RawStr(word), &RawVInt(1))?;
//!         }
//!         Ok(MapFlow::Continue)
//!     }
//! }
//!
//! struct WcReducer;
//!
//! impl Reducer for WcReducer {
//!     fn new_key(&self) -> Box<dyn Sv> { Box::new(RawStr::default()) }
//!     fn new_val(&self) -> Box<dyn Sv> { Box::new(RawVInt(0)) }
//!
//!     fn reduce(&mut self, key: &dyn Sv, vals: &mut dyn SvIter,
//!         c: &mut [Box<dyn CollectCloser>]) -> varg::Result<()>
//!     {
//!         let mut count = 0;
//!         while let Some(v) = vals.next()? {
//!             count += v.downcast_ref::<RawVInt>().expect("count").0;
//!         }
//!         c[0].collect(key, &RawVInt(count))
//!     }
//! }
//!
//! fn main() -> varg::Result<()> {
//!     let job = MrJob {
//!         source: vec![Box::new(DirInput(FsPath::local("mrin")))],
//!         new_mapper: Some(Box::new(|_src, _part| Box::new(WcMapper))),
//!         new_reducer: Some(Box::new(|_part| Box::new(WcReducer))),
//!         sorter: Some(Box::new(FileSorter::new(FsPath::local("tmp")))),
//!         dest: vec![Box::new(DirOutput(FsPath::local("mrout")))],
//!     };
//!     job.run()
//! }
//! ```

pub mod api;
pub mod codec;
pub mod dirio;
pub mod error;
pub mod fs;
pub mod io;
pub mod kvfile;
pub mod runtime;
pub mod sorters;
pub mod utils;

pub use api::{MapFlow, Mapper, OnlyMapper, Reducer, SvIter};
pub use codec::{Bytes, I32, Len, Null, RawBytes, RawStr, RawVInt, Str, Sv, Time, VInt};
pub use dirio::{DirInput, DirOutput};
pub use error::{Error, Result};
pub use fs::{FsPath, LocalFs};
pub use kvfile::{KvReader, KvWriter};
pub use runtime::{MapOnlyJob, MrJob};
pub use sorters::{FileSorter, MemSorter, Sorter};
