//! Compilation targets and device contexts.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Target backend plus device ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub dev_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Cuda,
    Llvm,
}

impl Target {
    pub fn cuda(dev_id: usize) -> Self {
        Self {
            kind: TargetKind::Cuda,
            dev_id,
        }
    }

    pub fn llvm(dev_id: usize) -> Self {
        Self {
            kind: TargetKind::Llvm,
            dev_id,
        }
    }

    pub fn parse(name: &str, dev_id: usize) -> Result<Self> {
        match name {
            "cuda" => Ok(Self::cuda(dev_id)),
            "llvm" => Ok(Self::llvm(dev_id)),
            other => bail!("only cuda/llvm targets are supported, got {other}"),
        }
    }

    pub fn device_ctx(&self) -> DeviceCtx {
        let kind = match self.kind {
            TargetKind::Cuda => DeviceKind::Gpu,
            TargetKind::Llvm => DeviceKind::Cpu,
        };
        DeviceCtx {
            kind,
            id: self.dev_id,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.kind {
            TargetKind::Cuda => "cuda",
            TargetKind::Llvm => "llvm",
        };
        write!(f, "{name}:{}", self.dev_id)
    }
}

/// Device context a session executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceCtx {
    pub kind: DeviceKind,
    pub id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl DeviceCtx {
    /// Wait for outstanding work on the device stream.
    ///
    /// The reference backend runs synchronously on the host, so there is
    /// nothing to drain; the call exists so profiling sites match the
    /// asynchronous-device protocol.
    pub fn stream_sync(&self) {}
}
