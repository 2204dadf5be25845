//! kv-tier-attn demo driver.
//!
//! Fills a tiered store with synthetic rows, runs one paged attention
//! forward pass per layer over the stored KV and prints the resulting
//! statistics.

use clap::Parser;
use serde_json::json;
use tracing::info;

use kv_tier_attn::attention::context::{AttentionContext, ForwardParams};
use kv_tier_attn::cache::pager::new_shared_pager;
use kv_tier_attn::config::{Cli, Config};
use kv_tier_attn::gpu::device::Device;
use kv_tier_attn::metrics::Metrics;

fn synthetic_row(len: usize, seed: usize) -> Vec<f32> {
    (0..len)
        .map(|i| ((seed * 31 + i * 7) % 17) as f32 / 17.0 - 0.5)
        .collect()
}

fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "kv_tier_attn=debug"
    } else {
        "kv_tier_attn=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("kv-tier-attn v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;
    let store_cfg = &config.store;

    info!(
        num_layers = store_cfg.num_layers,
        row_bytes = store_cfg.row_bytes(),
        host_budget = store_cfg.host_budget_bytes,
        positions_per_layer = store_cfg.positions_per_layer(),
        "Configuration loaded"
    );

    let pager = new_shared_pager(store_cfg.clone())?;
    let device = Device::emulated(config.attention.device, config.device.memory_bytes);
    let attn_cfg = config.attention_for_store();
    let dtype = attn_cfg.dtype;
    let mut ctx = AttentionContext::new(&device, attn_cfg.clone())?;

    // Append positions in lockstep across layers.
    let row_elems = attn_cfg.num_kv_heads * attn_cfg.head_dim;
    for pos in 0..cli.positions {
        for layer in 0..pager.num_layers() {
            let k = dtype.encode(&synthetic_row(row_elems, pos + layer));
            let v = dtype.encode(&synthetic_row(row_elems, pos * 3 + layer));
            pager.append(layer, &k, &v)?;
        }
    }
    info!(positions = cli.positions, "Store filled");

    let num_q_heads = cli.q_heads.unwrap_or(attn_cfg.num_kv_heads);
    let q_elems = cli.batch * num_q_heads * attn_cfg.head_dim;
    let q = device.alloc_from(&dtype.encode(&synthetic_row(q_elems, 1)))?;
    let out = device.alloc(q_elems * dtype.size())?;

    for layer in 0..pager.num_layers() {
        let range = pager.get_layer(layer)?;
        ctx.register_range(layer, &range)?;
        ctx.forward(
            layer,
            &q,
            &out,
            ForwardParams {
                batch_size: cli.batch,
                num_q_heads,
                seq_len: range.count,
                scale: 0.0,
            },
            None,
        )?;
        ctx.unregister(layer);
    }

    let store_stats = pager.get_stats()?;
    let attn_stats = ctx.stats();
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "device": device.info(),
            "chunk_size": ctx.chunk_size(),
            "store": store_stats,
            "attention": attn_stats,
        }))?
    );

    if cli.metrics {
        let metrics = Metrics::new()?;
        metrics.observe_store(&store_stats);
        metrics.observe_attention(&attn_stats);
        print!("{}", metrics.render()?);
    }

    Ok(())
}
