//! Deterministic lexical embedding of entity names.
//!
//! Feature hashing over word tokens and padded character trigrams. It is
//! deterministic, offline, and dependency-free beyond `blake3`. It is *not* a
//! neural embedding model; it gives the embedding detection strategy a stable
//! baseline that is robust to word order and small spelling differences.

use blake3::Hasher;

use crate::similarity::normalize;

/// Default embedding dimensionality.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

fn bucket_and_sign(feature: &str, dim: usize) -> (usize, f32) {
    let mut h = Hasher::new();
    h.update(feature.as_bytes());
    let hash = h.finalize();
    let bytes = hash.as_bytes();

    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    let bucket = u64::from_le_bytes(raw);

    #[allow(clippy::cast_possible_truncation)]
    let idx = (bucket % dim as u64) as usize;
    let sign = if (bytes[8] & 1) == 0 { 1.0f32 } else { -1.0f32 };
    (idx, sign)
}

/// Create a deterministic lexical embedding for a set of names.
#[must_use]
pub fn name_embedding<'a, I>(names: I) -> Vec<f32>
where
    I: IntoIterator<Item = &'a str>,
{
    name_embedding_with_dim(names, DEFAULT_EMBEDDING_DIM)
}

/// Create a deterministic lexical embedding with a custom dimension.
#[must_use]
pub fn name_embedding_with_dim<'a, I>(names: I, dim: usize) -> Vec<f32>
where
    I: IntoIterator<Item = &'a str>,
{
    if dim == 0 {
        return Vec::new();
    }

    let mut vec = vec![0.0f32; dim];
    let mut count = 0u32;

    for name in names {
        let normalized = normalize(name);
        for token in normalized.split_whitespace() {
            let (idx, sign) = bucket_and_sign(&format!("w:{token}"), dim);
            vec[idx] += sign;

            let padded: Vec<char> = format!("^{token}$").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                let (idx, sign) = bucket_and_sign(&format!("g:{gram}"), dim);
                vec[idx] += sign;
            }
            count = count.saturating_add(1);
        }
    }

    if count == 0 {
        return vec;
    }

    // L2-normalize.
    let mut norm2 = 0.0f64;
    for &x in &vec {
        norm2 += f64::from(x) * f64::from(x);
    }
    if norm2 > 0.0 {
        let inv = (norm2.sqrt()).recip();
        #[allow(clippy::cast_possible_truncation)]
        let invf = inv as f32;
        for x in &mut vec {
            *x *= invf;
        }
    }

    vec
}

/// Cosine similarity of two equal-length vectors; 0.0 for empty, zero or
/// mismatched inputs.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
