//! Paged attention context: one device's ping-pong chunk buffers and the
//! double-buffered forward pass.
//!
//! While chunk `c` is folded on the compute stream, chunk `c + 1` is copied
//! into the other slot on the transfer stream. A slot is only overwritten
//! after the compute that read it has finished, so at most two chunks are
//! resident at any time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attention::kernel::{HeadGeometry, OnlineSoftmax};
use crate::cache::pager::KvRange;
use crate::config::{AttentionConfig, ConfigError};
use crate::dtype::DType;
use crate::error::ErrorClass;
use crate::gpu::allocator::AllocatorError;
use crate::gpu::device::Device;
use crate::gpu::memory::{DeviceBuffer, PinnedSlice};
use crate::gpu::stream::{Event, Stream, StreamError};
use crate::transfer::gpu_transfer::{ChunkCopy, GpuTransferEngine, GpuTransferError};

/// Largest chunk the auto-selection will pick.
pub const MAX_AUTO_CHUNK: usize = 2048;

#[derive(Error, Debug)]
pub enum AttentionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("num_q_heads {num_q_heads} is not a positive multiple of num_kv_heads {num_kv_heads}")]
    HeadMismatch {
        num_q_heads: usize,
        num_kv_heads: usize,
    },

    #[error("{what} buffer is {got} bytes, need {needed}")]
    BufferSize {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error("No host KV registered for layer {0}")]
    NoHostKv(usize),

    #[error("seq_len {seq_len} exceeds the {registered} positions registered for layer {layer}")]
    SeqLenExceeded {
        layer: usize,
        seq_len: usize,
        registered: usize,
    },

    #[error("Device {0} not available")]
    DeviceNotAvailable(usize),

    #[error(transparent)]
    Allocation(#[from] AllocatorError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Transfer(#[from] GpuTransferError),

    #[error("Context is unusable after a device failure; re-create it")]
    Unusable,

    #[error("Runtime state poisoned by a panicking caller")]
    Poisoned,
}

impl AttentionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttentionError::Config(_)
            | AttentionError::HeadMismatch { .. }
            | AttentionError::BufferSize { .. }
            | AttentionError::Unsupported(_) => ErrorClass::Config,
            AttentionError::NoHostKv(_)
            | AttentionError::SeqLenExceeded { .. }
            | AttentionError::DeviceNotAvailable(_) => ErrorClass::Addressing,
            AttentionError::Transfer(e) => e.class(),
            AttentionError::Allocation(_)
            | AttentionError::Stream(_)
            | AttentionError::Unusable
            | AttentionError::Poisoned => ErrorClass::Device,
        }
    }

    pub fn status(&self) -> i32 {
        self.class().status()
    }

    /// Whether the error leaves the streams in an unknown state.
    fn is_device_failure(&self) -> bool {
        matches!(
            self,
            AttentionError::Stream(_)
                | AttentionError::Transfer(GpuTransferError::Stream(_))
                | AttentionError::Poisoned
        )
    }
}

/// Cumulative forward-pass statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttentionStats {
    pub forward_calls: u64,
    pub chunks_processed: u64,
    /// Host → device bytes (K and V).
    pub bytes_transferred: u64,
    /// Time spent in chunk copies, excluding waits for a free slot.
    pub transfer_time_ms: f64,
    /// Time spent decoding Q, folding chunks and writing the output.
    pub compute_time_ms: f64,
}

/// One ping-pong slot: a chunk of K and a chunk of V on the device.
#[derive(Debug)]
struct ChunkSlot {
    k: DeviceBuffer,
    v: DeviceBuffer,
}

/// A registered host KV source. Not owned: the views keep the memory alive
/// but the caller decides what it contains.
#[derive(Debug, Clone)]
struct HostKv {
    k: PinnedSlice,
    v: PinnedSlice,
    total: usize,
}

/// Per-call parameters of [`AttentionContext::forward`].
#[derive(Debug, Clone, Copy)]
pub struct ForwardParams {
    pub batch_size: usize,
    pub num_q_heads: usize,
    pub seq_len: usize,
    /// Score scale; 0.0 selects `1/√head_dim`.
    pub scale: f32,
}

/// State the compute stream owns for one forward call.
struct ComputeState {
    q: Vec<f64>,
    softmax: OnlineSoftmax,
}

/// Largest power of two ≤ [`MAX_AUTO_CHUNK`] whose four chunk buffers fit
/// in `free_bytes`.
pub fn auto_chunk_size(free_bytes: u64, row_bytes: usize) -> Option<usize> {
    let mut chunk = MAX_AUTO_CHUNK;
    while chunk > 0 {
        if (4 * chunk * row_bytes) as u64 <= free_bytes {
            return Some(chunk);
        }
        chunk /= 2;
    }
    None
}

/// Paged attention engine for one device.
pub struct AttentionContext {
    device: Device,
    config: AttentionConfig,
    chunk_size: usize,
    row_bytes: usize,

    slots: [ChunkSlot; 2],
    /// Slot holding the chunk being computed.
    current: usize,
    /// Per slot, completes when the last compute reading it has finished.
    slot_free: [Event; 2],

    transfer_stream: Stream,
    compute_stream: Stream,
    transfer: GpuTransferEngine,

    host_kv: HashMap<usize, HostKv>,
    stats: Arc<Mutex<AttentionStats>>,
    usable: bool,
}

impl AttentionContext {
    /// Allocate the ping-pong buffers on `device`. A zero `chunk_size`
    /// selects one automatically.
    pub fn new(device: &Device, config: AttentionConfig) -> Result<Self, AttentionError> {
        config.validate()?;
        let row_bytes = config.row_bytes();
        let chunk_size = match config.chunk_size {
            0 => auto_chunk_size(device.free_memory(), row_bytes).ok_or(
                AllocatorError::OutOfMemory {
                    device_id: device.id(),
                    needed: 4 * row_bytes as u64,
                    free: device.free_memory(),
                },
            )?,
            n => n,
        };

        let chunk_bytes = chunk_size * row_bytes;
        let slot = || -> Result<ChunkSlot, AllocatorError> {
            Ok(ChunkSlot {
                k: device.alloc(chunk_bytes)?,
                v: device.alloc(chunk_bytes)?,
            })
        };
        let slots = [slot()?, slot()?];

        info!(
            device = device.id(),
            chunk_size,
            chunk_bytes,
            num_kv_heads = config.num_kv_heads,
            head_dim = config.head_dim,
            dtype = %config.dtype,
            "Created attention context"
        );

        Ok(Self {
            transfer_stream: device.create_stream("transfer")?,
            compute_stream: device.create_stream("compute")?,
            transfer: GpuTransferEngine::new(device.id()),
            device: device.clone(),
            config: AttentionConfig {
                chunk_size,
                ..config
            },
            chunk_size,
            row_bytes,
            slots,
            current: 0,
            slot_free: [Event::completed(), Event::completed()],
            host_kv: HashMap::new(),
            stats: Arc::new(Mutex::new(AttentionStats::default())),
            usable: true,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Element type of Q, K, V and the output.
    pub fn dtype(&self) -> DType {
        self.config.dtype
    }

    pub fn is_usable(&self) -> bool {
        self.usable && !self.transfer_stream.is_faulted() && !self.compute_stream.is_faulted()
    }

    /// Bytes per position of K (or V).
    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    /// Register host K/V views of `total_positions` positions for `layer`,
    /// replacing any previous registration.
    pub fn register_host_kv(
        &mut self,
        layer: usize,
        k: PinnedSlice,
        v: PinnedSlice,
        total_positions: usize,
    ) -> Result<(), AttentionError> {
        let needed = total_positions * self.row_bytes;
        for (what, view) in [("host K", &k), ("host V", &v)] {
            if view.len() < needed {
                return Err(AttentionError::BufferSize {
                    what,
                    needed,
                    got: view.len(),
                });
            }
        }
        debug!(layer, total_positions, "Registered host KV");
        self.host_kv.insert(
            layer,
            HostKv {
                k,
                v,
                total: total_positions,
            },
        );
        Ok(())
    }

    /// Register a range returned by the store.
    pub fn register_range(&mut self, layer: usize, range: &KvRange) -> Result<(), AttentionError> {
        if range.count > 0 && range.row_bytes != self.row_bytes {
            return Err(AttentionError::BufferSize {
                what: "store row",
                needed: self.row_bytes,
                got: range.row_bytes,
            });
        }
        self.register_host_kv(layer, range.k.clone(), range.v.clone(), range.count)
    }

    pub fn unregister(&mut self, layer: usize) {
        self.host_kv.remove(&layer);
    }

    /// Snapshot of the cumulative statistics. Work still running on a
    /// caller-supplied stream is not included yet.
    pub fn stats(&self) -> AttentionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = AttentionStats::default();
    }

    /// Attention of `batch_size × num_q_heads` query rows in `q` against the
    /// first `seq_len` registered positions of `layer`, written to `output`
    /// as `[batch_size, num_q_heads, head_dim]`.
    ///
    /// Without `stream` the call returns once `output` is written. With a
    /// caller stream the call returns after enqueueing; the caller's stream
    /// waits for completion and later work on it may read `output`.
    pub fn forward(
        &mut self,
        layer: usize,
        q: &DeviceBuffer,
        output: &DeviceBuffer,
        params: ForwardParams,
        stream: Option<&Stream>,
    ) -> Result<(), AttentionError> {
        if !self.is_usable() {
            return Err(AttentionError::Unusable);
        }
        let nkv = self.config.num_kv_heads;
        if params.num_q_heads == 0 || params.num_q_heads % nkv != 0 {
            return Err(AttentionError::HeadMismatch {
                num_q_heads: params.num_q_heads,
                num_kv_heads: nkv,
            });
        }
        let host = self
            .host_kv
            .get(&layer)
            .cloned()
            .ok_or(AttentionError::NoHostKv(layer))?;
        if params.seq_len > host.total {
            return Err(AttentionError::SeqLenExceeded {
                layer,
                seq_len: params.seq_len,
                registered: host.total,
            });
        }
        let io_bytes =
            params.batch_size * params.num_q_heads * self.config.head_dim * self.config.dtype.size();
        for (what, buf) in [("Q", q), ("output", output)] {
            if buf.device_id() != self.device.id() {
                return Err(AttentionError::DeviceNotAvailable(buf.device_id()));
            }
            if buf.len() < io_bytes {
                return Err(AttentionError::BufferSize {
                    what,
                    needed: io_bytes,
                    got: buf.len(),
                });
            }
        }

        match self.run_pipeline(&host, q, output, params, stream) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_device_failure() {
                    warn!(layer, error = %e, "Forward failed; attention context is unusable");
                    self.usable = false;
                }
                Err(e)
            }
        }
    }

    /// Enqueue the copy of one chunk into `slot`. The returned event fires
    /// when the chunk is on the device.
    fn upload(
        &self,
        host: &HostKv,
        chunk: usize,
        slot: usize,
        seq_len: usize,
        spans: &mut Vec<(Event, Event)>,
    ) -> Result<Event, AttentionError> {
        let start = chunk * self.chunk_size;
        let n = self.chunk_size.min(seq_len - start);
        self.transfer_stream.wait_event(&self.slot_free[slot])?;
        let begin = self.transfer_stream.record()?;
        let copy = ChunkCopy {
            k_src: host.k.clone(),
            v_src: host.v.clone(),
            offset: start * self.row_bytes,
            len: n * self.row_bytes,
            k_dst: self.slots[slot].k.clone(),
            v_dst: self.slots[slot].v.clone(),
        };
        self.transfer.copy_to_device_async(&self.transfer_stream, copy)?;
        let end = self.transfer_stream.record()?;
        spans.push((begin, end.clone()));
        Ok(end)
    }

    /// Enqueue `op` on the compute stream, bracketed by events.
    fn enqueue_timed<F>(&self, spans: &mut Vec<(Event, Event)>, op: F) -> Result<Event, AttentionError>
    where
        F: FnOnce() -> Result<(), StreamError> + Send + 'static,
    {
        let begin = self.compute_stream.record()?;
        self.compute_stream.enqueue_fallible(op)?;
        let end = self.compute_stream.record()?;
        spans.push((begin, end.clone()));
        Ok(end)
    }

    fn run_pipeline(
        &mut self,
        host: &HostKv,
        q: &DeviceBuffer,
        output: &DeviceBuffer,
        params: ForwardParams,
        stream: Option<&Stream>,
    ) -> Result<(), AttentionError> {
        let dtype = self.config.dtype;
        let geometry = HeadGeometry {
            num_q_heads: params.num_q_heads,
            num_kv_heads: self.config.num_kv_heads,
            head_dim: self.config.head_dim,
        };
        let scale = if params.scale == 0.0 {
            1.0 / (self.config.head_dim as f64).sqrt()
        } else {
            params.scale as f64
        };
        let seq_len = params.seq_len;
        let num_chunks = seq_len.div_ceil(self.chunk_size);
        let row_bytes = self.row_bytes;

        // Q is produced by the caller's prior work.
        if let Some(caller) = stream {
            self.compute_stream.wait_event(&caller.record()?)?;
        }

        let mut transfer_spans = Vec::with_capacity(num_chunks);
        let mut compute_spans = Vec::with_capacity(num_chunks + 2);
        let state = Arc::new(Mutex::new(ComputeState {
            q: Vec::new(),
            softmax: OnlineSoftmax::new(geometry, params.batch_size),
        }));
        {
            let (state, q) = (Arc::clone(&state), q.clone());
            let rows = params.batch_size * params.num_q_heads * geometry.head_dim;
            self.enqueue_timed(&mut compute_spans, move || {
                let bytes = q.read();
                let mut st = state.lock().map_err(|_| StreamError::OpFailed("state poisoned".into()))?;
                st.q = (0..rows).map(|i| dtype.load(&bytes, i)).collect();
                Ok(())
            })?;
        }

        let mut ready = if num_chunks > 0 {
            Some(self.upload(host, 0, self.current, seq_len, &mut transfer_spans)?)
        } else {
            None
        };

        for chunk in 0..num_chunks {
            let cur = self.current;
            let other = 1 - cur;
            let next_ready = if chunk + 1 < num_chunks {
                Some(self.upload(host, chunk + 1, other, seq_len, &mut transfer_spans)?)
            } else {
                None
            };

            if let Some(event) = ready.take() {
                event.synchronize()?;
            }

            let n = self.chunk_size.min(seq_len - chunk * self.chunk_size);
            let (k, v) = (self.slots[cur].k.clone(), self.slots[cur].v.clone());
            let state = Arc::clone(&state);
            self.slot_free[cur] = self.enqueue_timed(&mut compute_spans, move || {
                let (k, v) = (k.read(), v.read());
                let mut st = state.lock().map_err(|_| StreamError::OpFailed("state poisoned".into()))?;
                let ComputeState { q, softmax } = &mut *st;
                softmax.fold_chunk(q, &k[..n * row_bytes], &v[..n * row_bytes], n, dtype, scale);
                Ok(())
            })?;
            debug!(chunk, slot = cur, positions = n, "Chunk enqueued");

            self.current = other;
            ready = next_ready;
        }

        {
            let (state, output) = (Arc::clone(&state), output.clone());
            self.enqueue_timed(&mut compute_spans, move || {
                let st = state.lock().map_err(|_| StreamError::OpFailed("state poisoned".into()))?;
                st.softmax.finalize_into(&mut output.write(), dtype);
                Ok(())
            })?;
        }

        {
            let stats = Arc::clone(&self.stats);
            let bytes = (seq_len * row_bytes * 2) as u64;
            self.compute_stream.enqueue_fallible(move || {
                if let Some((_, last)) = transfer_spans.last() {
                    last.synchronize()?;
                }
                let ms = |spans: &[(Event, Event)]| {
                    spans
                        .iter()
                        .filter_map(|(begin, end)| Event::elapsed(begin, end))
                        .sum::<Duration>()
                        .as_secs_f64()
                        * 1e3
                };
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.forward_calls += 1;
                s.chunks_processed += num_chunks as u64;
                s.bytes_transferred += bytes;
                s.transfer_time_ms += ms(&transfer_spans);
                s.compute_time_ms += ms(&compute_spans);
                Ok(())
            })?;
        }
        let done = self.compute_stream.record()?;

        match stream {
            Some(caller) => caller.wait_event(&done)?,
            None => {
                done.synchronize()?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for AttentionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionContext")
            .field("device", &self.device.id())
            .field("chunk_size", &self.chunk_size)
            .field("registered_layers", &self.host_kv.len())
            .field("usable", &self.usable)
            .finish()
    }
}
