//! Phase-scoped view over a native body buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use trestle_filter_api::{BufferInstance, FilterError, Phase};

use crate::engine::BufferAction;
use crate::request::RequestState;

pub struct BufferView {
    state: Arc<RequestState>,
    phase: Phase,
    /// Opaque native buffer handle, valid only while the phase is active.
    buffer: u64,
    length: AtomicU64,
}

impl BufferView {
    pub(crate) fn new(
        state: Arc<RequestState>,
        phase: Phase,
        buffer: u64,
        length: u64,
    ) -> BufferView {
        BufferView {
            state,
            phase,
            buffer,
            length: AtomicU64::new(length),
        }
    }

    fn check_phase(&self) -> Result<(), FilterError> {
        self.state.check_phase(self.phase)
    }

    fn write(&self, data: &[u8], action: BufferAction) -> Result<(), FilterError> {
        self.check_phase()?;
        self.state
            .engine
            .set_buffer(self.state.handle, self.buffer, data, action)?;
        match action {
            BufferAction::Set => self.length.store(data.len() as u64, Ordering::Release),
            BufferAction::Append | BufferAction::Prepend => {
                self.length.fetch_add(data.len() as u64, Ordering::AcqRel);
            }
        }
        Ok(())
    }
}

impl BufferInstance for BufferView {
    fn bytes(&self) -> Result<Bytes, FilterError> {
        self.check_phase()?;
        let length = self.length.load(Ordering::Acquire);
        if length == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .state
            .engine
            .get_buffer(self.state.handle, self.buffer, length)?;
        Ok(Bytes::from(data))
    }

    fn len(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    fn set(&self, data: &[u8]) -> Result<(), FilterError> {
        self.write(data, BufferAction::Set)
    }

    fn append(&self, data: &[u8]) -> Result<(), FilterError> {
        self.write(data, BufferAction::Append)
    }

    fn prepend(&self, data: &[u8]) -> Result<(), FilterError> {
        self.write(data, BufferAction::Prepend)
    }
}
