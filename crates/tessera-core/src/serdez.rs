// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Custom field serializers.
//!
//! Fields allocated with a [`SerdezId`] are not plain bytes: whenever their
//! values cross an instance boundary (copies) they are serialized by the
//! registered operator and deserialized on the other side.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::ident::SerdezId;

/// Serializer/deserializer pair for one field type.
pub trait SerdezOp: Send + Sync + core::fmt::Debug {
    /// Encodes one stored value for transfer.
    fn serialize(&self, value: &[u8]) -> Vec<u8>;
    /// Decodes a transferred value into its stored form.
    fn deserialize(&self, wire: &[u8]) -> Vec<u8>;
}

/// Id → serializer table.
#[derive(Debug, Clone, Default)]
pub struct SerdezRegistry {
    ops: BTreeMap<SerdezId, Arc<dyn SerdezOp>>,
}

impl SerdezRegistry {
    /// Registers a serializer.
    pub fn register(&mut self, id: SerdezId, op: Arc<dyn SerdezOp>) -> Result<(), RuntimeError> {
        if self.ops.contains_key(&id) {
            return Err(RuntimeError::DuplicateRegistration {
                kind: "serdez operator",
                id: id.value(),
            });
        }
        self.ops.insert(id, op);
        Ok(())
    }

    /// Serializer by id.
    pub fn get(&self, id: SerdezId) -> Result<&Arc<dyn SerdezOp>, RuntimeError> {
        self.ops.get(&id).ok_or(RuntimeError::UnknownRegistration {
            kind: "serdez operator",
            id: id.value(),
        })
    }

    /// Moves `value` across an instance boundary.
    pub fn transfer(&self, id: Option<SerdezId>, value: Vec<u8>) -> Result<Vec<u8>, RuntimeError> {
        match id {
            None => Ok(value),
            Some(id) => {
                let op = self.get(id)?;
                Ok(op.deserialize(&op.serialize(&value)))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Stores values in little-endian, ships them big-endian.
    #[derive(Debug)]
    struct Swap;

    impl SerdezOp for Swap {
        fn serialize(&self, value: &[u8]) -> Vec<u8> {
            value.iter().rev().copied().collect()
        }
        fn deserialize(&self, wire: &[u8]) -> Vec<u8> {
            wire.iter().rev().copied().collect()
        }
    }

    #[test]
    fn transfer_round_trips_through_the_operator() {
        let mut reg = SerdezRegistry::default();
        let id = SerdezId::from_raw(3);
        reg.register(id, Arc::new(Swap)).unwrap();
        assert!(reg.register(id, Arc::new(Swap)).is_err());
        assert_eq!(reg.transfer(Some(id), vec![1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert_eq!(reg.transfer(None, vec![9]).unwrap(), vec![9]);
        assert!(reg.transfer(Some(SerdezId::from_raw(4)), vec![]).is_err());
    }
}
