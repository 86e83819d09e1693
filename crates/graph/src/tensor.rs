//! Tensor metadata and shared runtime buffers.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    BF16,
}

impl DataType {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 | DataType::BF16 => 2,
        }
    }
}

/// Dense index into a graph's tensor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub usize);

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorMeta {
    pub fn new(name: impl Into<String>, shape: &[usize], dtype: DataType) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.elements() * self.dtype.element_size_bytes()
    }

    /// Rows/cols view of a rank-2 tensor; rank-1 is treated as a single row.
    pub fn dims2(&self) -> (usize, usize) {
        match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            [cols] => (1, *cols),
            _ => (1, self.elements()),
        }
    }
}

/// A runtime buffer shared between the evaluate and execute stages.
///
/// The containing tables are read-only once allocated; only the buffer
/// contents mutate, guarded by the inner lock. Storage is f32 regardless
/// of the declared dtype (the reference backend computes in f32).
#[derive(Debug)]
pub struct TensorBuffer {
    meta: TensorMeta,
    data: RwLock<Vec<f32>>,
}

impl TensorBuffer {
    pub fn zeros(meta: TensorMeta) -> Self {
        let len = meta.elements();
        Self {
            meta,
            data: RwLock::new(vec![0.0; len]),
        }
    }

    pub fn from_vec(meta: TensorMeta, data: Vec<f32>) -> Result<Self> {
        if data.len() != meta.elements() {
            bail!(
                "buffer for {} expects {} elements, got {}",
                meta.name,
                meta.elements(),
                data.len()
            );
        }
        Ok(Self {
            meta,
            data: RwLock::new(data),
        })
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<f32>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<f32>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite the contents from a slice of the same length.
    pub fn fill_from(&self, values: &[f32]) -> Result<()> {
        let mut guard = self.write();
        if guard.len() != values.len() {
            bail!(
                "fill for {} expects {} elements, got {}",
                self.meta.name,
                guard.len(),
                values.len()
            );
        }
        guard.copy_from_slice(values);
        Ok(())
    }
}
