// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Task registration and the context handed to task bodies.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::Pod;
use bytes::Bytes;

use crate::context::Context;
use crate::domain::{DomainPoint, IndexSet};
use crate::error::{FutureError, RuntimeError, TaskError};
use crate::event::{Event, UserEvent};
use crate::future::Future;
use crate::ident::{FieldId, FieldSpaceId, OpId, TaskId};
use crate::instance::PhysicalRegion;
use crate::privilege::FieldSet;
use crate::region_tree::LogicalRegion;
use crate::requirement::OutputRequirement;

/// Value returned by a task body.
pub type TaskValue = Bytes;

/// Task body.
pub type TaskBody = Arc<dyn Fn(&mut TaskContext) -> Result<TaskValue, TaskError> + Send + Sync>;

/// One registered task.
#[derive(Clone)]
pub struct TaskVariant {
    id: TaskId,
    name: &'static str,
    body: TaskBody,
}

impl core::fmt::Debug for TaskVariant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskVariant")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TaskVariant {
    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Task name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn body(&self) -> &TaskBody {
        &self.body
    }
}

/// Id → task table. Ids and names are both unique.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<TaskId, TaskVariant>,
}

impl TaskRegistry {
    /// Registers `body` under `id` and `name`.
    pub fn register(&mut self, id: TaskId, name: &'static str, body: TaskBody) -> Result<(), RuntimeError> {
        if let Some(existing) = self
            .tasks
            .values()
            .find(|t| t.id == id || t.name == name)
        {
            return Err(RuntimeError::DuplicateTask {
                id: existing.id,
                name: existing.name,
            });
        }
        self.tasks.insert(id, TaskVariant { id, name, body });
        Ok(())
    }

    /// Task by id.
    pub fn get(&self, id: TaskId) -> Result<&TaskVariant, RuntimeError> {
        self.tasks.get(&id).ok_or(RuntimeError::UnknownTask(id))
    }

    /// Task by name.
    pub fn find(&self, name: &str) -> Option<&TaskVariant> {
        self.tasks.values().find(|t| t.name == name)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Values a task writes into one output requirement. The points written
/// become the index space of the region created when the task finishes.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    requirement: OutputRequirement,
    sizes: BTreeMap<FieldId, usize>,
    values: BTreeMap<FieldId, BTreeMap<DomainPoint, Vec<u8>>>,
}

impl OutputBuffer {
    pub(crate) fn new(requirement: OutputRequirement, sizes: BTreeMap<FieldId, usize>) -> Self {
        Self {
            requirement,
            sizes,
            values: BTreeMap::new(),
        }
    }

    /// Fields this buffer accepts.
    pub fn fields(&self) -> &FieldSet {
        &self.requirement.fields
    }

    /// Writes `value` for `field` at `point`.
    pub fn write(&mut self, field: FieldId, point: DomainPoint, value: &[u8]) -> Result<(), TaskError> {
        let size = *self
            .sizes
            .get(&field)
            .ok_or(crate::error::AccessError::FieldNotMapped(field))?;
        if value.len() != size {
            return Err(crate::error::AccessError::SizeMismatch {
                field,
                expected: size,
                found: value.len(),
            }
            .into());
        }
        if point.dim() != self.requirement.dim {
            return Err(TaskError::Failed(format!(
                "output point {point} has {} dimensions, expected {}",
                point.dim(),
                self.requirement.dim
            )));
        }
        self.values.entry(field).or_default().insert(point, value.to_vec());
        Ok(())
    }

    /// Typed write.
    pub fn write_as<T: Pod>(&mut self, field: FieldId, point: DomainPoint, value: T) -> Result<(), TaskError> {
        self.write(field, point, bytemuck::bytes_of(&value))
    }

    pub(crate) fn field_space(&self) -> FieldSpaceId {
        self.requirement.field_space
    }

    /// Every point written through any field.
    pub(crate) fn domain(&self) -> IndexSet {
        IndexSet::from_points(
            self.requirement.dim,
            self.values.values().flat_map(|m| m.keys().copied()),
        )
    }

    pub(crate) fn into_values(self) -> BTreeMap<FieldId, BTreeMap<DomainPoint, Vec<u8>>> {
        self.values
    }
}

#[derive(Debug, Clone)]
enum OutputSlot {
    Pending,
    Ready(LogicalRegion),
    Empty,
    Failed(String),
}

/// Region created by a task's output requirement, available once the task
/// finishes.
#[derive(Debug, Clone)]
pub struct OutputRegion {
    slot: Arc<Mutex<OutputSlot>>,
    ready: UserEvent,
}

impl OutputRegion {
    pub(crate) fn pending() -> Self {
        Self {
            slot: Arc::new(Mutex::new(OutputSlot::Pending)),
            ready: UserEvent::new(),
        }
    }

    fn bind(&self, value: OutputSlot) {
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*slot, OutputSlot::Pending) {
                return;
            }
            *slot = value;
        }
        self.ready.trigger();
    }

    pub(crate) fn set(&self, region: LogicalRegion) {
        self.bind(OutputSlot::Ready(region));
    }

    pub(crate) fn set_empty(&self) {
        self.bind(OutputSlot::Empty);
    }

    pub(crate) fn fail(&self, reason: &str) {
        self.bind(OutputSlot::Failed(reason.to_owned()));
    }

    /// Event triggered once the region exists (or never will).
    pub fn event(&self) -> Event {
        self.ready.event()
    }

    /// Blocks until the producing task finishes and returns the region.
    pub fn region(&self) -> Result<LogicalRegion, FutureError> {
        self.ready.event().wait();
        match &*self.slot.lock().unwrap_or_else(PoisonError::into_inner) {
            OutputSlot::Ready(r) => Ok(*r),
            OutputSlot::Empty => Err(FutureError::Empty),
            OutputSlot::Failed(reason) => Err(FutureError::Poisoned(reason.clone())),
            OutputSlot::Pending => Err(FutureError::Poisoned("output region never bound".into())),
        }
    }
}

/// Everything a running task can see.
pub struct TaskContext {
    pub(crate) task: TaskId,
    pub(crate) op: OpId,
    pub(crate) point: Option<DomainPoint>,
    pub(crate) index_domain: Option<IndexSet>,
    pub(crate) args: Bytes,
    pub(crate) regions: Vec<PhysicalRegion>,
    pub(crate) futures: Vec<Future>,
    pub(crate) outputs: Vec<OutputBuffer>,
    pub(crate) attempt: u32,
    pub(crate) context: Context,
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("op", &self.op)
            .field("point", &self.point)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// Task being run.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Operation being run.
    pub fn op(&self) -> OpId {
        self.op
    }

    /// Launch point, for index launches.
    pub fn point(&self) -> Option<DomainPoint> {
        self.point
    }

    /// Launch domain, for index launches.
    pub fn index_domain(&self) -> Option<&IndexSet> {
        self.index_domain.as_ref()
    }

    /// Zero on the first execution, counting up on resilient replays.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Raw argument bytes.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Arguments read as `T`.
    pub fn args_as<T: Pod>(&self) -> Result<T, TaskError> {
        bytemuck::try_pod_read_unaligned(&self.args).map_err(|_| {
            FutureError::SizeMismatch {
                expected: core::mem::size_of::<T>(),
                found: self.args.len(),
            }
            .into()
        })
    }

    /// Mapped region of requirement `index`.
    pub fn region(&self, index: usize) -> Result<&PhysicalRegion, TaskError> {
        self.regions
            .get(index)
            .ok_or_else(|| TaskError::Failed(format!("no region requirement {index}")))
    }

    /// All mapped regions in requirement order.
    pub fn regions(&self) -> &[PhysicalRegion] {
        &self.regions
    }

    /// Future argument `index`; bound before the body starts.
    pub fn future(&self, index: usize) -> Result<&Future, TaskError> {
        self.futures
            .get(index)
            .ok_or_else(|| TaskError::Failed(format!("no future argument {index}")))
    }

    /// Output buffer of output requirement `index`.
    pub fn output(&mut self, index: usize) -> Result<&mut OutputBuffer, TaskError> {
        self.outputs
            .get_mut(index)
            .ok_or_else(|| TaskError::Failed(format!("no output requirement {index}")))
    }

    /// Context for launching child operations. Its privileges are exactly
    /// this task's region requirements.
    pub fn context(&self) -> &Context {
        &self.context
    }
}
