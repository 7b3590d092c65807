//! Phase-scoped view over native header and trailer maps.
//!
//! The view is lazily materialized: the first read copies every entry in
//! one native round trip into a private cache, later reads hit the cache,
//! and mutations update the cache and the native side together. The cache
//! belongs to one request and phases never run concurrently, so a plain
//! mutex is enough.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use trestle_filter_api::{FilterError, HeaderMap, Phase, RawValue};

use crate::request::RequestState;

type CachedMap = HashMap<String, Vec<String>>;

pub struct HeaderView {
    state: Arc<RequestState>,
    phase: Phase,
    count: u64,
    byte_size: u64,
    cache: Mutex<Option<CachedMap>>,
}

impl HeaderView {
    pub(crate) fn new(
        state: Arc<RequestState>,
        phase: Phase,
        count: u64,
        byte_size: u64,
    ) -> HeaderView {
        HeaderView {
            state,
            phase,
            count,
            byte_size,
            cache: Mutex::new(None),
        }
    }

    /// Fail unless the request is still in the phase this view was built
    /// for; the underlying native memory may otherwise be reused already.
    fn check_phase(&self) -> Result<(), FilterError> {
        self.state.check_phase(self.phase)
    }

    /// Run `f` against the cached map, materializing it first if needed.
    fn with_cache<T>(&self, f: impl FnOnce(&mut CachedMap) -> T) -> Result<T, FilterError> {
        self.check_phase()?;
        let mut guard = self.cache.lock();
        if guard.is_none() {
            let entries = if self.phase.is_trailer() {
                self.state
                    .engine
                    .copy_trailers(self.state.handle, self.count, self.byte_size)?
            } else {
                self.state
                    .engine
                    .copy_headers(self.state.handle, self.count, self.byte_size)?
            };
            let mut map: CachedMap = HashMap::with_capacity(entries.len());
            for (key, value) in entries {
                map.entry(key).or_default().push(value);
            }
            *guard = Some(map);
        }
        let Some(map) = guard.as_mut() else {
            return Err(FilterError::fault("header cache unavailable"));
        };
        Ok(f(map))
    }

    /// Propagate a single-key write natively, routed through the trailer
    /// call for trailer phases.
    fn write_native(&self, key: &str, value: &str, add: bool) -> Result<(), FilterError> {
        if self.phase.is_trailer() {
            self.state.engine.set_trailer(self.state.handle, key, value)
        } else {
            self.state
                .engine
                .set_header(self.state.handle, key, value, add)
        }
    }
}

impl HeaderMap for HeaderView {
    fn get(&self, key: &str) -> Result<Option<String>, FilterError> {
        self.with_cache(|map| map.get(key).and_then(|values| values.first().cloned()))
    }

    fn values(&self, key: &str) -> Result<Vec<String>, FilterError> {
        self.with_cache(|map| map.get(key).cloned().unwrap_or_default())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, FilterError> {
        self.with_cache(|map| {
            let mut flat = Vec::new();
            for (key, values) in map.iter() {
                for value in values {
                    flat.push((key.clone(), value.clone()));
                }
            }
            flat
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), FilterError> {
        self.check_phase()?;
        {
            let mut guard = self.cache.lock();
            if let Some(map) = guard.as_mut() {
                map.insert(key.to_string(), vec![value.to_string()]);
            }
        }
        self.write_native(key, value, false)
    }

    fn add(&self, key: &str, value: &str) -> Result<(), FilterError> {
        self.check_phase()?;
        {
            let mut guard = self.cache.lock();
            if let Some(map) = guard.as_mut() {
                map.entry(key.to_string()).or_default().push(value.to_string());
            }
        }
        self.write_native(key, value, true)
    }

    fn remove(&self, key: &str) -> Result<(), FilterError> {
        self.check_phase()?;
        {
            let mut guard = self.cache.lock();
            if let Some(map) = guard.as_mut() {
                map.remove(key);
            }
        }
        self.state.engine.remove_header(self.state.handle, key)
    }

    fn byte_size(&self) -> u64 {
        self.byte_size
    }

    unsafe fn get_raw(&self, key: &str) -> Result<RawValue, FilterError> {
        self.check_phase()?;
        self.state.engine.get_header(self.state.handle, key)
    }
}
