//! Chunk math for paged attention.
//!
//! [`OnlineSoftmax`] keeps, per query row, the running max `m`, normalizer
//! `l` and weighted sum `O` in f64, so chunks can be folded one at a time
//! without ever holding the full score matrix. Folding the same sequence
//! in any chunking gives the same result up to rounding.

use crate::dtype::DType;

/// Head layout shared by Q, K, V and the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadGeometry {
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl HeadGeometry {
    /// Query heads per KV head.
    pub fn group_size(&self) -> usize {
        self.num_q_heads / self.num_kv_heads
    }

    /// KV head attended by query head `q_head`.
    #[inline]
    pub fn kv_head(&self, q_head: usize) -> usize {
        q_head / self.group_size()
    }

    /// Elements per KV position (all KV heads).
    pub fn kv_row_elems(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

/// Running softmax state for `batch × num_q_heads` query rows.
#[derive(Debug, Clone)]
pub struct OnlineSoftmax {
    geometry: HeadGeometry,
    batch: usize,
    m: Vec<f64>,
    l: Vec<f64>,
    o: Vec<f64>,
    scores: Vec<f64>,
}

impl OnlineSoftmax {
    pub fn new(geometry: HeadGeometry, batch: usize) -> Self {
        let rows = batch * geometry.num_q_heads;
        Self {
            geometry,
            batch,
            m: vec![f64::NEG_INFINITY; rows],
            l: vec![0.0; rows],
            o: vec![0.0; rows * geometry.head_dim],
            scores: Vec::new(),
        }
    }

    pub fn rows(&self) -> usize {
        self.m.len()
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Fold `n` KV positions into every query row.
    ///
    /// `q` holds `[batch, num_q_heads, head_dim]` values already widened;
    /// `k` and `v` hold `[n, num_kv_heads, head_dim]` elements of `dtype`.
    /// Scores are `scale · q·k`.
    pub fn fold_chunk(&mut self, q: &[f64], k: &[u8], v: &[u8], n: usize, dtype: DType, scale: f64) {
        if n == 0 {
            return;
        }
        let HeadGeometry {
            num_q_heads,
            head_dim,
            ..
        } = self.geometry;
        let row_elems = self.geometry.kv_row_elems();
        self.scores.resize(n, 0.0);

        for row in 0..self.rows() {
            let kvh = self.geometry.kv_head(row % num_q_heads);
            let q_row = &q[row * head_dim..(row + 1) * head_dim];

            let mut chunk_max = f64::NEG_INFINITY;
            for j in 0..n {
                let base = j * row_elems + kvh * head_dim;
                let dot: f64 = q_row
                    .iter()
                    .enumerate()
                    .map(|(d, &qd)| qd * dtype.load(k, base + d))
                    .sum();
                let s = dot * scale;
                self.scores[j] = s;
                chunk_max = chunk_max.max(s);
            }

            let m_old = self.m[row];
            let m_new = m_old.max(chunk_max);
            if m_new == f64::NEG_INFINITY {
                continue;
            }
            let alpha = if m_old == f64::NEG_INFINITY {
                0.0
            } else {
                (m_old - m_new).exp()
            };

            let out = &mut self.o[row * head_dim..(row + 1) * head_dim];
            let mut l = self.l[row] * alpha;
            for x in out.iter_mut() {
                *x *= alpha;
            }
            for j in 0..n {
                let p = (self.scores[j] - m_new).exp();
                l += p;
                let base = j * row_elems + kvh * head_dim;
                for (d, x) in out.iter_mut().enumerate() {
                    *x += p * dtype.load(v, base + d);
                }
            }
            self.l[row] = l;
            self.m[row] = m_new;
        }
    }

    /// Normalized output `O / l`, zero for rows that saw no positions.
    pub fn finalize(&self) -> Vec<f64> {
        let head_dim = self.geometry.head_dim;
        let mut out = vec![0.0; self.o.len()];
        for row in 0..self.rows() {
            let l = self.l[row];
            if l == 0.0 {
                continue;
            }
            for d in 0..head_dim {
                out[row * head_dim + d] = self.o[row * head_dim + d] / l;
            }
        }
        out
    }

    /// Finalize straight into `dst` as `dtype` elements.
    pub fn finalize_into(&self, dst: &mut [u8], dtype: DType) {
        for (i, value) in self.finalize().into_iter().enumerate() {
            dtype.store(dst, i, value);
        }
    }
}

/// Softmax attention over the whole sequence in one pass. Reference for
/// the chunked path; `q`, `k`, `v` laid out as in [`OnlineSoftmax::fold_chunk`].
pub fn direct_attention(
    geometry: HeadGeometry,
    batch: usize,
    q: &[f64],
    k: &[f64],
    v: &[f64],
    seq_len: usize,
    scale: f64,
) -> Vec<f64> {
    let hd = geometry.head_dim;
    let row_elems = geometry.kv_row_elems();
    let rows = batch * geometry.num_q_heads;
    let mut out = vec![0.0; rows * hd];
    if seq_len == 0 {
        return out;
    }
    for row in 0..rows {
        let kvh = geometry.kv_head(row % geometry.num_q_heads);
        let q_row = &q[row * hd..(row + 1) * hd];
        let scores: Vec<f64> = (0..seq_len)
            .map(|j| {
                let base = j * row_elems + kvh * hd;
                q_row.iter().zip(&k[base..base + hd]).map(|(a, b)| a * b).sum::<f64>() * scale
            })
            .collect();
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = weights.iter().sum();
        for (j, w) in weights.iter().enumerate() {
            let base = j * row_elems + kvh * hd;
            for d in 0..hd {
                out[row * hd + d] += w / total * v[base + d];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> HeadGeometry {
        HeadGeometry {
            num_q_heads: 4,
            num_kv_heads: 2,
            head_dim: 4,
        }
    }

    fn synthetic(len: usize, seed: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (((i as u32).wrapping_mul(2654435761) ^ seed) % 1000) as f32 / 250.0 - 2.0)
            .collect()
    }

    #[test]
    fn test_gqa_mapping() {
        let g = HeadGeometry {
            num_q_heads: 8,
            num_kv_heads: 2,
            head_dim: 16,
        };
        assert_eq!(g.group_size(), 4);
        assert_eq!((0..8).map(|h| g.kv_head(h)).collect::<Vec<_>>(), vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn test_chunked_matches_direct() {
        let g = geometry();
        let seq = 13;
        let dtype = DType::F32;
        let q: Vec<f64> = synthetic(g.num_q_heads * g.head_dim, 1).iter().map(|&x| x as f64).collect();
        let k32 = synthetic(seq * g.kv_row_elems(), 2);
        let v32 = synthetic(seq * g.kv_row_elems(), 3);
        let (k, v) = (dtype.encode(&k32), dtype.encode(&v32));
        let widen = |xs: &[f32]| xs.iter().map(|&x| x as f64).collect::<Vec<_>>();
        let expected = direct_attention(g, 1, &q, &widen(&k32), &widen(&v32), seq, 0.5);

        for chunk in [1, 2, 5, seq] {
            let mut acc = OnlineSoftmax::new(g, 1);
            let row_bytes = g.kv_row_elems() * dtype.size();
            let mut start = 0;
            while start < seq {
                let n = chunk.min(seq - start);
                let bytes = start * row_bytes..(start + n) * row_bytes;
                acc.fold_chunk(&q, &k[bytes.clone()], &v[bytes], n, dtype, 0.5);
                start += n;
            }
            for (a, b) in acc.finalize().iter().zip(&expected) {
                assert!((a - b).abs() < 1e-9, "chunk {chunk}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_empty_window_is_zero() {
        let acc = OnlineSoftmax::new(geometry(), 2);
        let out = acc.finalize();
        assert_eq!(out.len(), 2 * 4 * 4);
        assert!(out.iter().all(|&x| x == 0.0));

        let mut bytes = vec![0xffu8; out.len() * 2];
        acc.finalize_into(&mut bytes, DType::F16);
        assert!(DType::F16.decode(&bytes).iter().all(|&x| x == 0.0));
    }
}
