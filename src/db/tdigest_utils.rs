//! TDigest serialization and merging for latency rollups.
//!
//! Digests are stored as varint-encoded centroid lists so bucket rows stay
//! small.

use tdigests::{Centroid, TDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Centroid cap applied after building or merging a digest.
pub const MAX_CENTROIDS: usize = 100;

/// Serialize a TDigest to bytes for storage.
///
/// Format: [centroid_count: varint] [mean_bits: varint, weight_bits: varint]...
pub fn serialize_tdigest(td: &TDigest) -> Vec<u8> {
    let centroids = td.centroids();
    let mut data = Vec::with_capacity(centroids.len() * 16 + 4);

    let mut buf = varint_encode::u64_buffer();
    data.extend_from_slice(varint_encode::u64(centroids.len() as u64, &mut buf));

    for c in centroids {
        data.extend_from_slice(varint_encode::u64(c.mean.to_bits(), &mut buf));
        data.extend_from_slice(varint_encode::u64(c.weight.to_bits(), &mut buf));
    }

    data
}

/// Deserialize a TDigest from stored bytes. Empty or truncated input yields `None`.
pub fn deserialize_tdigest(data: &[u8]) -> Option<TDigest> {
    if data.is_empty() {
        return None;
    }

    let (count, mut remaining) = varint_decode::u64(data).ok()?;
    if count == 0 {
        return None;
    }

    let mut centroids = Vec::with_capacity(count.min(MAX_CENTROIDS as u64 * 4) as usize);
    for _ in 0..count {
        let (mean_bits, rest) = varint_decode::u64(remaining).ok()?;
        let (weight_bits, rest) = varint_decode::u64(rest).ok()?;
        remaining = rest;
        centroids.push(Centroid::new(f64::from_bits(mean_bits), f64::from_bits(weight_bits)));
    }

    Some(TDigest::from_centroids(centroids))
}

/// Build a compressed digest from raw values.
pub fn digest_from_values(values: Vec<f64>) -> Option<TDigest> {
    if values.is_empty() {
        return None;
    }
    let mut td = TDigest::from_values(values);
    td.compress(MAX_CENTROIDS);
    Some(td)
}

/// Merge digests by pooling their centroids.
pub fn merge_digests(digests: impl IntoIterator<Item = TDigest>) -> Option<TDigest> {
    let mut centroids: Vec<Centroid> = digests
        .into_iter()
        .flat_map(|td| {
            td.centroids()
                .iter()
                .map(|c| Centroid::new(c.mean, c.weight))
                .collect::<Vec<_>>()
        })
        .collect();
    if centroids.is_empty() {
        return None;
    }
    centroids.sort_by(|a, b| a.mean.total_cmp(&b.mean));
    let mut td = TDigest::from_centroids(centroids);
    td.compress(MAX_CENTROIDS);
    Some(td)
}

/// Get TDigest statistics: (min, max, sum, count), computed from centroids.
pub fn get_tdigest_stats(td: &TDigest) -> (f64, f64, f64, f64) {
    let centroids = td.centroids();
    if centroids.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut sum = 0.0;
    let mut count = 0.0;

    for c in centroids {
        min = min.min(c.mean);
        max = max.max(c.mean);
        sum += c.mean * c.weight;
        count += c.weight;
    }

    (min, max, sum, count)
}
