//! End-to-end: tiered store feeding the paged attention engine.

use tempfile::TempDir;

use kv_tier_attn::attention::bridge::{AttentionRuntime, ComputeRequest};
use kv_tier_attn::attention::context::{AttentionContext, ForwardParams};
use kv_tier_attn::attention::kernel::{direct_attention, HeadGeometry};
use kv_tier_attn::cache::pager::Pager;
use kv_tier_attn::config::{AttentionConfig, Config, EvictionConfig, StoreConfig};
use kv_tier_attn::dtype::DType;
use kv_tier_attn::gpu::device::{detect_devices, Device};
use kv_tier_attn::metrics::Metrics;

const NUM_KV_HEADS: usize = 2;
const HEAD_DIM: usize = 8;
const POSITIONS: usize = 50;

fn store_config(tmp: &TempDir) -> StoreConfig {
    StoreConfig {
        num_layers: 2,
        num_kv_heads: NUM_KV_HEADS,
        head_dim: HEAD_DIM,
        elem_bytes: 2,
        host_budget_bytes: 4096,
        local_disk_path: Some(tmp.path().join("ssd")),
        local_disk_budget: 1 << 20,
        eviction: EvictionConfig { spill_batch: 16 },
        ..Default::default()
    }
}

fn row_values(layer: usize, pos: usize, which: usize) -> Vec<f32> {
    (0..NUM_KV_HEADS * HEAD_DIM)
        .map(|i| ((pos * 7 + i * 3 + layer * 11 + which * 5) % 23) as f32 / 23.0 - 0.5)
        .collect()
}

fn fill(pager: &Pager) {
    for pos in 0..POSITIONS {
        for layer in 0..2 {
            let k = DType::F16.encode(&row_values(layer, pos, 0));
            let v = DType::F16.encode(&row_values(layer, pos, 1));
            assert_eq!(pager.append(layer, &k, &v).unwrap(), pos);
        }
    }
}

#[test]
fn test_spill_and_reload_full_layer() {
    let tmp = TempDir::new().unwrap();
    let pager = Pager::new(store_config(&tmp)).unwrap();
    fill(&pager);

    let stats = pager.get_stats().unwrap();
    assert!(stats.disk_positions > 0);
    assert!(stats.disk_bytes_written > 0);
    assert!(stats.host_used_bytes <= 4096);
    assert_eq!(stats.total_positions, 2 * POSITIONS);

    let range = pager.get_layer(0).unwrap();
    assert_eq!(range.count, POSITIONS);
    for pos in 0..POSITIONS {
        assert_eq!(range.k_row(pos), DType::F16.encode(&row_values(0, pos, 0)));
        assert_eq!(range.v_row(pos), DType::F16.encode(&row_values(0, pos, 1)));
    }
    assert!(pager.get_stats().unwrap().disk_bytes_read > 0);
}

#[test]
fn test_attention_over_tiered_store() {
    let tmp = TempDir::new().unwrap();
    let pager = Pager::new(store_config(&tmp)).unwrap();
    fill(&pager);

    let device = Device::emulated(0, 1 << 20);
    let dtype = DType::F16;
    let config = Config {
        store: store_config(&tmp),
        ..Default::default()
    };
    // 50 positions in chunks of 16: four chunks, the last one partial.
    let attn_cfg = AttentionConfig {
        chunk_size: 16,
        ..config.attention_for_store()
    };
    assert_eq!(attn_cfg.dtype, DType::F16);
    let mut ctx = AttentionContext::new(&device, attn_cfg).unwrap();

    let geometry = HeadGeometry {
        num_q_heads: 4,
        num_kv_heads: NUM_KV_HEADS,
        head_dim: HEAD_DIM,
    };
    let q_vals: Vec<f32> = (0..geometry.num_q_heads * HEAD_DIM)
        .map(|i| (i % 5) as f32 / 5.0 - 0.4)
        .collect();
    let q = device.alloc_from(&dtype.encode(&q_vals)).unwrap();
    let out = device.alloc(q_vals.len() * 2).unwrap();

    for layer in 0..2 {
        let range = pager.get_layer(layer).unwrap();
        ctx.register_range(layer, &range).unwrap();
        let params = ForwardParams {
            batch_size: 1,
            num_q_heads: geometry.num_q_heads,
            seq_len: range.count,
            scale: 0.0,
        };
        ctx.forward(layer, &q, &out, params, None).unwrap();

        let widen = |b: Vec<u8>| dtype.decode(&b).into_iter().map(f64::from).collect::<Vec<_>>();
        let expected = direct_attention(
            geometry,
            1,
            &widen(dtype.encode(&q_vals)),
            &widen(range.k.to_vec()),
            &widen(range.v.to_vec()),
            POSITIONS,
            1.0 / (HEAD_DIM as f64).sqrt(),
        );
        let got = widen(out.to_vec());
        for (a, b) in got.iter().zip(&expected) {
            assert!((a - b).abs() <= 1e-3 * b.abs().max(1.0), "layer {layer}: {a} vs {b}");
        }
    }

    let metrics = Metrics::new().unwrap();
    metrics.observe_store(&pager.get_stats().unwrap());
    metrics.observe_attention(&ctx.stats());
    assert_eq!(ctx.stats().chunks_processed, 8);
    assert!(metrics.render().unwrap().contains("kv_tier_attn_attention_forward_calls 2"));
}

#[test]
fn test_bridge_over_store_range() {
    let tmp = TempDir::new().unwrap();
    let pager = Pager::new(store_config(&tmp)).unwrap();
    fill(&pager);

    let runtime = AttentionRuntime::new(detect_devices(1, 1 << 20));
    let device = runtime.device(0).unwrap();
    let range = pager.get_layer(1).unwrap();
    let q = device.alloc_from(&DType::F16.encode(&[0.1; 2 * HEAD_DIM])).unwrap();
    let dst = device.alloc(2 * HEAD_DIM * 2).unwrap();

    let status = runtime.compute(ComputeRequest {
        q: &q,
        k: &range.k,
        v: &range.v,
        dst: &dst,
        head_dim: HEAD_DIM,
        head_dim_v: HEAD_DIM,
        num_q_heads: 2,
        num_kv_heads: NUM_KV_HEADS,
        seq_q: 1,
        total_seq: range.count,
        batch: 1,
        scale: 0.0,
        chunk_size: 0,
        dtype: DType::F16,
        device: 0,
        stream: None,
    });
    assert_eq!(status, 0);
    assert!(DType::F16.decode(&dst.to_vec()).iter().all(|x| x.is_finite()));
    runtime.shutdown();
}
