//! Function-object adapters for every engine capability.
//!
//! Each `Fn*` struct implements its capability trait by delegating to
//! optional boxed closures; unset fields fall back to the capability's
//! documented default (reusable [`RawBytes`] slots, no-op bodies, empty
//! iterators). They keep one-off mappers, inputs and collectors — common
//! in tests and small jobs — from needing a named type each.

use crate::api::{
    CollectCloser, Collector, Input, IterateCloser, MapFlow, Mapper, OnlyMapper, Output,
    PartCollector, Reducer, SvIter,
};
use crate::codec::{RawBytes, Sv};
use crate::error::Result;

/// Factory closure producing a fresh reusable key or value slot.
pub type SvFactory = Box<dyn Fn() -> Box<dyn Sv> + Send + Sync>;

fn default_slot() -> Box<dyn Sv> {
    // RawBytes accepts any encoded payload
    Box::new(RawBytes::default())
}

/// [`OnlyMapper`] assembled from closures.
#[derive(Default)]
pub struct FnOnlyMapper {
    pub new_key: Option<SvFactory>,
    pub new_val: Option<SvFactory>,
    #[allow(clippy::type_complexity)]
    pub map: Option<
        Box<dyn FnMut(&dyn Sv, &dyn Sv, &mut [Box<dyn CollectCloser>]) -> Result<MapFlow> + Send>,
    >,
    #[allow(clippy::type_complexity)]
    pub map_end: Option<Box<dyn FnMut(&mut [Box<dyn CollectCloser>]) -> Result<()> + Send>>,
}

impl OnlyMapper for FnOnlyMapper {
    fn new_key(&self) -> Box<dyn Sv> {
        self.new_key.as_ref().map_or_else(default_slot, |f| f())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        self.new_val.as_ref().map_or_else(default_slot, |f| f())
    }

    fn map(
        &mut self,
        key: &dyn Sv,
        val: &dyn Sv,
        c: &mut [Box<dyn CollectCloser>],
    ) -> Result<MapFlow> {
        match &mut self.map {
            Some(f) => f(key, val, c),
            None => Ok(MapFlow::Continue),
        }
    }

    fn map_end(&mut self, c: &mut [Box<dyn CollectCloser>]) -> Result<()> {
        match &mut self.map_end {
            Some(f) => f(c),
            None => Ok(()),
        }
    }
}

/// [`Mapper`] assembled from closures.
#[derive(Default)]
pub struct FnMapper {
    pub new_key: Option<SvFactory>,
    pub new_val: Option<SvFactory>,
    #[allow(clippy::type_complexity)]
    pub map: Option<Box<dyn FnMut(&dyn Sv, &dyn Sv, &dyn PartCollector) -> Result<MapFlow> + Send>>,
    #[allow(clippy::type_complexity)]
    pub map_end: Option<Box<dyn FnMut(&dyn PartCollector) -> Result<()> + Send>>,
}

impl Mapper for FnMapper {
    fn new_key(&self) -> Box<dyn Sv> {
        self.new_key.as_ref().map_or_else(default_slot, |f| f())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        self.new_val.as_ref().map_or_else(default_slot, |f| f())
    }

    fn map(&mut self, key: &dyn Sv, val: &dyn Sv, c: &dyn PartCollector) -> Result<MapFlow> {
        match &mut self.map {
            Some(f) => f(key, val, c),
            None => Ok(MapFlow::Continue),
        }
    }

    fn map_end(&mut self, c: &dyn PartCollector) -> Result<()> {
        match &mut self.map_end {
            Some(f) => f(c),
            None => Ok(()),
        }
    }
}

/// [`Reducer`] assembled from closures.
#[derive(Default)]
pub struct FnReducer {
    pub new_key: Option<SvFactory>,
    pub new_val: Option<SvFactory>,
    #[allow(clippy::type_complexity)]
    pub reduce: Option<
        Box<
            dyn FnMut(&dyn Sv, &mut dyn SvIter, &mut [Box<dyn CollectCloser>]) -> Result<()>
                + Send,
        >,
    >,
    #[allow(clippy::type_complexity)]
    pub reduce_end: Option<Box<dyn FnMut(&mut [Box<dyn CollectCloser>]) -> Result<()> + Send>>,
}

impl Reducer for FnReducer {
    fn new_key(&self) -> Box<dyn Sv> {
        self.new_key.as_ref().map_or_else(default_slot, |f| f())
    }

    fn new_val(&self) -> Box<dyn Sv> {
        self.new_val.as_ref().map_or_else(default_slot, |f| f())
    }

    fn reduce(
        &mut self,
        key: &dyn Sv,
        vals: &mut dyn SvIter,
        c: &mut [Box<dyn CollectCloser>],
    ) -> Result<()> {
        match &mut self.reduce {
            Some(f) => f(key, vals, c),
            None => Ok(()),
        }
    }

    fn reduce_end(&mut self, c: &mut [Box<dyn CollectCloser>]) -> Result<()> {
        match &mut self.reduce_end {
            Some(f) => f(c),
            None => Ok(()),
        }
    }
}

/// [`Input`] assembled from closures. Defaults to zero partitions and
/// empty iterators.
#[derive(Default)]
pub struct FnInput {
    #[allow(clippy::type_complexity)]
    pub part_count: Option<Box<dyn Fn() -> Result<usize> + Send + Sync>>,
    #[allow(clippy::type_complexity)]
    pub iterator: Option<Box<dyn Fn(usize) -> Result<Box<dyn IterateCloser>> + Send + Sync>>,
}

impl Input for FnInput {
    fn part_count(&self) -> Result<usize> {
        match &self.part_count {
            Some(f) => f(),
            None => Ok(0),
        }
    }

    fn iterator(&self, part: usize) -> Result<Box<dyn IterateCloser>> {
        match &self.iterator {
            Some(f) => f(part),
            None => Ok(Box::new(FnIterateCloser::default())),
        }
    }
}

/// [`Output`] assembled from a closure. Defaults to discarding
/// collectors.
#[derive(Default)]
pub struct FnOutput {
    #[allow(clippy::type_complexity)]
    pub collector: Option<Box<dyn Fn(usize) -> Result<Box<dyn CollectCloser>> + Send + Sync>>,
}

impl Output for FnOutput {
    fn collector(&self, part: usize) -> Result<Box<dyn CollectCloser>> {
        match &self.collector {
            Some(f) => f(part),
            None => Ok(Box::new(NullCollector)),
        }
    }
}

/// An [`Output`] whose collectors discard everything.
pub struct NullOutput;

impl Output for NullOutput {
    fn collector(&self, _part: usize) -> Result<Box<dyn CollectCloser>> {
        Ok(Box::new(NullCollector))
    }
}

/// A [`CollectCloser`] that ignores everything collected into it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollector;

impl Collector for NullCollector {
    fn collect(&mut self, _key: &dyn Sv, _val: &dyn Sv) -> Result<()> {
        Ok(())
    }
}

impl CollectCloser for NullCollector {
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// [`IterateCloser`] assembled from closures. The default iterator is
/// immediately exhausted.
#[derive(Default)]
pub struct FnIterateCloser {
    #[allow(clippy::type_complexity)]
    pub next: Option<Box<dyn FnMut(&mut dyn Sv, &mut dyn Sv) -> Result<bool> + Send>>,
    #[allow(clippy::type_complexity)]
    pub close: Option<Box<dyn FnMut() -> Result<()> + Send>>,
}

impl IterateCloser for FnIterateCloser {
    fn next(&mut self, key: &mut dyn Sv, val: &mut dyn Sv) -> Result<bool> {
        match &mut self.next {
            Some(f) => f(key, val),
            None => Ok(false),
        }
    }

    fn close(&mut self) -> Result<()> {
        match &mut self.close {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}

/// [`CollectCloser`] assembled from closures.
#[derive(Default)]
pub struct FnCollectCloser {
    #[allow(clippy::type_complexity)]
    pub collect: Option<Box<dyn FnMut(&dyn Sv, &dyn Sv) -> Result<()> + Send>>,
    #[allow(clippy::type_complexity)]
    pub close: Option<Box<dyn FnMut() -> Result<()> + Send>>,
}

impl Collector for FnCollectCloser {
    fn collect(&mut self, key: &dyn Sv, val: &dyn Sv) -> Result<()> {
        match &mut self.collect {
            Some(f) => f(key, val),
            None => Ok(()),
        }
    }
}

impl CollectCloser for FnCollectCloser {
    fn close(&mut self) -> Result<()> {
        match &mut self.close {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}
