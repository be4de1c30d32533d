// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Mapper doubles.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tessera_core::{DefaultMapper, InstanceLayout, MappableInfo, Mapper, MapperError, OpId, ProcessorId};

/// Delegates to an inner mapper and records every call.
#[derive(Clone)]
pub struct RecordingMapper {
    inner: Arc<dyn Mapper>,
    log: Arc<Mutex<Log>>,
}

#[derive(Default)]
struct Log {
    mapped: Vec<MappableInfo>,
    selected: Vec<(OpId, ProcessorId)>,
    epochs: Vec<Vec<ProcessorId>>,
}

impl Default for RecordingMapper {
    fn default() -> Self {
        Self::new(Arc::new(DefaultMapper))
    }
}

impl RecordingMapper {
    /// Records calls forwarded to `inner`.
    pub fn new(inner: Arc<dyn Mapper>) -> Self {
        Self {
            inner,
            log: Arc::default(),
        }
    }

    /// Every `map_operation` request, in call order.
    pub fn mapped(&self) -> Vec<MappableInfo> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).mapped.clone()
    }

    /// Every processor selection, in call order.
    pub fn selected(&self) -> Vec<(OpId, ProcessorId)> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).selected.clone()
    }

    /// Processor sets chosen for must-epoch launches.
    pub fn epochs(&self) -> Vec<Vec<ProcessorId>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).epochs.clone()
    }
}

impl Mapper for RecordingMapper {
    fn select_processor(&self, info: &MappableInfo, load: &[usize]) -> ProcessorId {
        let proc = self.inner.select_processor(info, load);
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .selected
            .push((info.op, proc));
        proc
    }

    fn map_operation(&self, info: &MappableInfo, attempt: u32) -> Result<Vec<InstanceLayout>, MapperError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mapped
            .push(info.clone());
        self.inner.map_operation(info, attempt)
    }

    fn select_must_epoch_processors(
        &self,
        tasks: &[MappableInfo],
        processors: usize,
    ) -> Result<Vec<ProcessorId>, MapperError> {
        let chosen = self.inner.select_must_epoch_processors(tasks, processors)?;
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epochs
            .push(chosen.clone());
        Ok(chosen)
    }
}

/// Requests a remap for the first `remaps` attempts of every operation,
/// then maps like [`DefaultMapper`].
#[derive(Clone, Default)]
pub struct RemapMapper {
    remaps: u32,
    attempts: Arc<Mutex<BTreeMap<OpId, u32>>>,
}

impl RemapMapper {
    /// Remaps each operation `remaps` times.
    pub fn new(remaps: u32) -> Self {
        Self {
            remaps,
            attempts: Arc::default(),
        }
    }

    /// Mapping attempts seen for `op`.
    pub fn attempts(&self, op: OpId) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .copied()
            .unwrap_or(0)
    }
}

impl Mapper for RemapMapper {
    fn select_processor(&self, info: &MappableInfo, load: &[usize]) -> ProcessorId {
        DefaultMapper.select_processor(info, load)
    }

    fn map_operation(&self, info: &MappableInfo, attempt: u32) -> Result<Vec<InstanceLayout>, MapperError> {
        *self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(info.op)
            .or_default() += 1;
        if attempt < self.remaps {
            return Err(MapperError::Remap(format!("attempt {attempt}")));
        }
        DefaultMapper.map_operation(info, attempt)
    }

    fn select_must_epoch_processors(
        &self,
        tasks: &[MappableInfo],
        processors: usize,
    ) -> Result<Vec<ProcessorId>, MapperError> {
        DefaultMapper.select_must_epoch_processors(tasks, processors)
    }
}
