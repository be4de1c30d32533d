// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Physical instances and the accessors handed to operation bodies.
//!
//! Every `(region tree, field)` pair is backed by one runtime-owned
//! [`FieldInstance`]: a point-keyed map of fixed-width byte values. Points
//! never written read as zero. Subregions share their root's instance, so a
//! write through a subregion is visible through the parent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::Pod;
use rustc_hash::FxHashMap;

use crate::domain::{DomainPoint, IndexSet};
use crate::error::AccessError;
use crate::ident::{FieldId, RegionTreeId};
use crate::privilege::{FieldSet, Privilege};
use crate::reduction::ReductionRegistry;
use crate::region_tree::LogicalRegion;
use crate::requirement::InstanceLayout;

/// Storage for one field of one region tree.
#[derive(Debug)]
pub struct FieldInstance {
    size: usize,
    data: Mutex<FxHashMap<DomainPoint, Vec<u8>>>,
}

impl FieldInstance {
    fn new(size: usize) -> Self {
        Self {
            size,
            data: Mutex::new(FxHashMap::default()),
        }
    }

    /// Bytes per point.
    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn read(&self, point: &DomainPoint) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(point)
            .cloned()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    pub(crate) fn write(&self, point: DomainPoint, value: Vec<u8>) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(point, value);
    }

    pub(crate) fn update<F>(&self, point: DomainPoint, f: F)
    where
        F: FnOnce(&mut Vec<u8>),
    {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let size = self.size;
        let slot = data.entry(point).or_insert_with(|| vec![0u8; size]);
        f(slot);
    }

    fn saved_points(self: &Arc<Self>, domain: &IndexSet) -> InstanceSnapshot {
        let saved = self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(p, _)| domain.contains(p))
            .map(|(p, v)| (*p, v.clone()))
            .collect();
        InstanceSnapshot {
            instance: Arc::clone(self),
            domain: domain.clone(),
            saved,
        }
    }

    fn clear_points(&self, domain: &IndexSet) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p, _| !domain.contains(p));
    }
}

/// Contents of one instance over a domain, as they were when taken.
#[derive(Debug)]
pub(crate) struct InstanceSnapshot {
    instance: Arc<FieldInstance>,
    domain: IndexSet,
    saved: Vec<(DomainPoint, Vec<u8>)>,
}

impl InstanceSnapshot {
    /// Puts the domain back: points absent at snapshot time read as zero again.
    pub(crate) fn restore(&self) {
        let mut data = self.instance.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.retain(|p, _| !self.domain.contains(p));
        data.extend(self.saved.iter().cloned());
    }
}

/// Runtime-owned map from `(tree, field)` to instance.
#[derive(Debug, Default)]
pub struct InstanceStore {
    fields: Mutex<FxHashMap<(RegionTreeId, FieldId), Arc<FieldInstance>>>,
}

impl InstanceStore {
    /// Instance backing `field` of `tree`, created on first use.
    pub fn instance(&self, tree: RegionTreeId, field: FieldId, size: usize) -> Arc<FieldInstance> {
        let mut fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            fields
                .entry((tree, field))
                .or_insert_with(|| Arc::new(FieldInstance::new(size))),
        )
    }

    /// Drops every instance of `tree`.
    pub fn drop_tree(&self, tree: RegionTreeId) {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(t, _), _| *t != tree);
    }

    /// Drops `field` from every tree.
    pub fn drop_field(&self, field: FieldId, trees: &[RegionTreeId]) {
        let mut fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        for t in trees {
            fields.remove(&(*t, field));
        }
    }

    /// Clears the points of `domain` in `field` of `tree`.
    pub(crate) fn clear(&self, tree: RegionTreeId, field: FieldId, domain: &IndexSet) {
        let fields = self.fields.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(inst) = fields.get(&(tree, field)) {
            inst.clear_points(domain);
        }
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.fields.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no instance is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A mapped region: the instances of its fields plus the privilege they
/// were mapped with.
#[derive(Debug, Clone)]
pub struct PhysicalRegion {
    region: LogicalRegion,
    domain: IndexSet,
    privilege: Privilege,
    layout: InstanceLayout,
    instances: Arc<FxHashMap<FieldId, Arc<FieldInstance>>>,
    reductions: Arc<ReductionRegistry>,
    mapped: Arc<AtomicBool>,
}

impl PhysicalRegion {
    pub(crate) fn new(
        region: LogicalRegion,
        domain: IndexSet,
        privilege: Privilege,
        layout: InstanceLayout,
        instances: FxHashMap<FieldId, Arc<FieldInstance>>,
        reductions: Arc<ReductionRegistry>,
    ) -> Self {
        Self {
            region,
            domain,
            privilege,
            layout,
            instances: Arc::new(instances),
            reductions,
            mapped: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Logical region mapped.
    pub fn region(&self) -> LogicalRegion {
        self.region
    }

    /// Points of the mapped region.
    pub fn domain(&self) -> &IndexSet {
        &self.domain
    }

    /// Privilege the region was mapped with.
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Layout chosen by the mapper.
    pub fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    /// Mapped fields.
    pub fn fields(&self) -> FieldSet {
        self.instances.keys().copied().collect()
    }

    /// Whether the mapping is still live.
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    pub(crate) fn unmap(&self) {
        self.mapped.store(false, Ordering::Release);
    }

    /// Saves every field this mapping may modify.
    pub(crate) fn snapshot(&self) -> Vec<InstanceSnapshot> {
        if !self.privilege.writes() && self.privilege.reduction().is_none() {
            return Vec::new();
        }
        self.instances
            .values()
            .map(|inst| inst.saved_points(&self.domain))
            .collect()
    }

    /// Whether both handles come from the same mapping.
    pub(crate) fn is_same_mapping(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mapped, &other.mapped)
    }

    fn check(
        &self,
        field: FieldId,
        point: &DomainPoint,
        allowed: bool,
        access: &'static str,
    ) -> Result<&Arc<FieldInstance>, AccessError> {
        if !self.is_mapped() {
            return Err(AccessError::Unmapped);
        }
        let inst = self
            .instances
            .get(&field)
            .ok_or(AccessError::FieldNotMapped(field))?;
        if !allowed {
            return Err(AccessError::PrivilegeViolation {
                field,
                privilege: self.privilege,
                access,
            });
        }
        if !self.domain.contains(point) {
            return Err(AccessError::PointOutOfBounds(*point));
        }
        Ok(inst)
    }

    fn check_width(inst: &FieldInstance, field: FieldId, found: usize) -> Result<(), AccessError> {
        if inst.size() == found {
            Ok(())
        } else {
            Err(AccessError::SizeMismatch {
                field,
                expected: inst.size(),
                found,
            })
        }
    }

    /// Reads the raw value of `field` at `point`.
    pub fn read(&self, field: FieldId, point: &DomainPoint) -> Result<Vec<u8>, AccessError> {
        let inst = self.check(field, point, self.privilege.reads(), "read")?;
        Ok(inst.read(point))
    }

    /// Writes the raw value of `field` at `point`.
    pub fn write(&self, field: FieldId, point: &DomainPoint, value: &[u8]) -> Result<(), AccessError> {
        let inst = self.check(field, point, self.privilege.writes(), "write")?;
        Self::check_width(inst, field, value.len())?;
        inst.write(*point, value.to_vec());
        Ok(())
    }

    /// Folds `value` into `field` at `point` with the mapped reduction.
    pub fn reduce(&self, field: FieldId, point: &DomainPoint, value: &[u8]) -> Result<(), AccessError> {
        let redop = self.privilege.reduction();
        let inst = self.check(field, point, redop.is_some(), "reduce")?;
        Self::check_width(inst, field, value.len())?;
        let redop = redop.ok_or(AccessError::FieldNotMapped(field))?;
        let op = self
            .reductions
            .get(redop)
            .ok_or(AccessError::UnknownReduction(redop))?;
        let size = inst.size();
        inst.update(*point, |acc| {
            op.fold(acc, value);
            acc.resize(size, 0);
        });
        Ok(())
    }

    /// Typed read.
    pub fn read_as<T: Pod>(&self, field: FieldId, point: &DomainPoint) -> Result<T, AccessError> {
        let raw = self.read(field, point)?;
        bytemuck::try_pod_read_unaligned(&raw).map_err(|_| AccessError::SizeMismatch {
            field,
            expected: raw.len(),
            found: core::mem::size_of::<T>(),
        })
    }

    /// Typed write.
    pub fn write_as<T: Pod>(&self, field: FieldId, point: &DomainPoint, value: T) -> Result<(), AccessError> {
        self.write(field, point, bytemuck::bytes_of(&value))
    }

    /// Typed reduction.
    pub fn reduce_as<T: Pod>(&self, field: FieldId, point: &DomainPoint, value: T) -> Result<(), AccessError> {
        self.reduce(field, point, bytemuck::bytes_of(&value))
    }

    /// Points of the mapped region in canonical order.
    pub fn points(&self) -> impl Iterator<Item = DomainPoint> + '_ {
        self.domain.points()
    }
}
