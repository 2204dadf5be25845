//! Status-code entry point for a host graph executor.
//!
//! [`AttentionRuntime`] is created and dropped explicitly by its owner. It
//! holds the devices and a cache of attention contexts keyed by geometry,
//! so repeated calls with the same shape reuse the same ping-pong buffers.
//! [`AttentionRuntime::compute`] never panics across the boundary: every
//! failure is reported as a negative status.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

use tracing::{error, info, warn};

use crate::attention::context::{AttentionContext, AttentionError, ForwardParams};
use crate::config::AttentionConfig;
use crate::dtype::DType;
use crate::error::ErrorClass;
use crate::gpu::device::Device;
use crate::gpu::memory::{DeviceBuffer, PinnedSlice};
use crate::gpu::stream::Stream;

/// Layer slot used for the caller's K/V in each cached context.
const BRIDGE_LAYER: usize = 0;

/// One attention op as handed over by the graph executor.
#[derive(Debug, Clone, Copy)]
pub struct ComputeRequest<'a> {
    /// Q on the device: `[seq_q, num_q_heads, head_dim]`.
    pub q: &'a DeviceBuffer,
    /// Pinned host K: `[total_seq, num_kv_heads, head_dim]`.
    pub k: &'a PinnedSlice,
    /// Pinned host V, laid out like K.
    pub v: &'a PinnedSlice,
    /// Device destination: `[seq_q, num_q_heads, head_dim_v]`.
    pub dst: &'a DeviceBuffer,
    pub head_dim: usize,
    pub head_dim_v: usize,
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    /// Query positions; used as the batch dimension.
    pub seq_q: usize,
    pub total_seq: usize,
    /// Outer batch; only 1 is supported.
    pub batch: usize,
    pub scale: f32,
    /// 0 selects automatically.
    pub chunk_size: usize,
    pub dtype: DType,
    pub device: usize,
    /// Caller stream for asynchronous completion.
    pub stream: Option<&'a Stream>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ContextKey {
    device: usize,
    num_kv_heads: usize,
    head_dim: usize,
    chunk_size: usize,
    dtype: DType,
}

/// Explicitly owned replacement for process-wide init and cleanup.
pub struct AttentionRuntime {
    devices: Vec<Device>,
    contexts: Mutex<HashMap<ContextKey, AttentionContext>>,
}

impl AttentionRuntime {
    pub fn new(devices: Vec<Device>) -> Self {
        info!(devices = devices.len(), "Attention runtime initialized");
        Self {
            devices,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self, id: usize) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// Number of cached attention contexts.
    pub fn cached_contexts(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run one attention op. Returns 0 on success, a negative status otherwise.
    pub fn compute(&self, request: ComputeRequest<'_>) -> i32 {
        match catch_unwind(AssertUnwindSafe(|| self.try_compute(request))) {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                warn!(error = %e, class = %e.class(), "Paged attention failed");
                e.status()
            }
            Err(_) => {
                error!("Paged attention panicked");
                ErrorClass::Device.status()
            }
        }
    }

    /// [`compute`](Self::compute) with the error kept.
    pub fn try_compute(&self, request: ComputeRequest<'_>) -> Result<(), AttentionError> {
        if request.batch > 1 {
            return Err(AttentionError::Unsupported(format!(
                "batch {} > 1 is not supported",
                request.batch
            )));
        }
        if request.head_dim_v != request.head_dim {
            return Err(AttentionError::Unsupported(format!(
                "head_dim_v {} differs from head_dim {}",
                request.head_dim_v, request.head_dim
            )));
        }
        let device = self
            .device(request.device)
            .ok_or(AttentionError::DeviceNotAvailable(request.device))?;

        let key = ContextKey {
            device: request.device,
            num_kv_heads: request.num_kv_heads,
            head_dim: request.head_dim,
            chunk_size: request.chunk_size,
            dtype: request.dtype,
        };
        let mut contexts = self.contexts.lock().map_err(|_| AttentionError::Poisoned)?;
        if contexts.get(&key).is_some_and(|ctx| !ctx.is_usable()) {
            warn!(?key, "Replacing unusable attention context");
            contexts.remove(&key);
        }
        if !contexts.contains_key(&key) {
            let ctx = AttentionContext::new(
                device,
                AttentionConfig {
                    num_kv_heads: request.num_kv_heads,
                    head_dim: request.head_dim,
                    chunk_size: request.chunk_size,
                    dtype: request.dtype,
                    device: request.device,
                },
            )?;
            contexts.insert(key, ctx);
        }
        let ctx = contexts
            .get_mut(&key)
            .ok_or(AttentionError::DeviceNotAvailable(request.device))?;

        ctx.register_host_kv(BRIDGE_LAYER, request.k.clone(), request.v.clone(), request.total_seq)?;
        let result = ctx.forward(
            BRIDGE_LAYER,
            request.q,
            request.dst,
            ForwardParams {
                batch_size: request.seq_q,
                num_q_heads: request.num_q_heads,
                seq_len: request.total_seq,
                scale: request.scale,
            },
            request.stream,
        );
        ctx.unregister(BRIDGE_LAYER);
        result
    }

    /// Release every context and its device buffers.
    pub fn shutdown(self) {
        let contexts = self
            .contexts
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        info!(contexts = contexts.len(), "Attention runtime shut down");
    }
}
