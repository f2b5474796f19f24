//! A deterministic stand-in producer.
//!
//! Real deployments plug the operator engine in behind [`Producer`]; this
//! implementation samples an analytic field instead, which makes cluster
//! experiments and integration tests self-contained and their payloads
//! byte-for-byte reproducible: two producers given the same semantic id,
//! rectangle and resolution emit identical bytes on any machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mo_cube::{QueryRect, Resolution};
use mo_types::{
    CacheType, CostProfile, Part, Produced, Producer, ProducerError, SemanticId,
};

/// Samples a per-semantic-id scalar field over the query rectangle.
#[derive(Default)]
pub struct SyntheticProducer {
    produce_calls: AtomicU64,
    /// Artificial computation time per produce call.
    delay: std::time::Duration,
}

impl SyntheticProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A producer that takes `delay` per computation, for experiments that
    /// need work to overlap in time.
    pub fn with_delay(delay: std::time::Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// How often [`Producer::produce`] ran; assembly does not count.
    pub fn produce_calls(&self) -> u64 {
        self.produce_calls.load(Ordering::Relaxed)
    }

    fn seed(semantic_id: &SemanticId) -> u64 {
        // FNV-1a over the id; any stable mixing works.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in semantic_id.as_str().bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        hash
    }

    fn sample(seed: u64, x: f64, y: f64, t: f64) -> u8 {
        let v = (x * 0.1).sin() + (y * 0.1).cos() + (t * 0.01).sin();
        let q = ((v + 3.0) / 6.0 * 255.0) as i64;
        (q as u8) ^ (seed as u8)
    }

    fn render(semantic_id: &SemanticId, rect: &QueryRect) -> Arc<[u8]> {
        let seed = Self::seed(semantic_id);
        let cube = rect.cube();
        let (width, height) = match rect.resolution {
            Resolution::Pixels { width, height } => (width, height),
            // Feature-ish payloads get a fixed sampling grid.
            Resolution::None => (16, 16),
        };

        let scale_x = cube.x().length() / f64::from(width);
        let scale_y = cube.y().length() / f64::from(height);
        let t = cube.t().lo;

        let mut out = Vec::with_capacity((width as usize) * (height as usize));
        for j in 0..height {
            let y = cube.y().lo + (f64::from(j) + 0.5) * scale_y;
            for i in 0..width {
                let x = cube.x().lo + (f64::from(i) + 0.5) * scale_x;
                out.push(Self::sample(seed, x, y, t));
            }
        }
        out.into()
    }

    fn result(semantic_id: &SemanticId, rect: &QueryRect) -> Produced {
        let payload = Self::render(semantic_id, rect);
        let cost = CostProfile {
            self_cpu: rect.volume().max(1.0) * 1e-6,
            all_cpu: rect.volume().max(1.0) * 1e-6,
            uncached_cpu: rect.volume().max(1.0) * 1e-6,
            self_io: payload.len() as u64,
            all_io: payload.len() as u64,
            uncached_io: payload.len() as u64,
            ..Default::default()
        };
        Produced {
            payload,
            bounds: rect.bounds,
            cost,
        }
    }
}

impl Producer for SyntheticProducer {
    fn produce(
        &self,
        _cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: &QueryRect,
    ) -> Result<Produced, ProducerError> {
        if semantic_id.as_str().starts_with("fail/") {
            return Err(ProducerError::new(format!("no such source: {semantic_id}")));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.produce_calls.fetch_add(1, Ordering::Relaxed);
        Ok(Self::result(semantic_id, rect))
    }

    fn assemble(
        &self,
        _cache_type: CacheType,
        semantic_id: &SemanticId,
        rect: &QueryRect,
        parts: &[Part],
    ) -> Result<Produced, ProducerError> {
        if parts.is_empty() {
            return Err(ProducerError::new("puzzle without pieces"));
        }
        // The field is analytic, so assembly samples it at the target grid;
        // the pieces carry the same samples over their own extents.
        Ok(Self::result(semantic_id, rect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mo_cube::{BoundsCube, Cube3, Srs, TimeKind};

    fn rect(x1: f64, x2: f64, w: u32) -> QueryRect {
        QueryRect::new(
            BoundsCube::new(
                Cube3::from_ranges(x1, x2, 0.0, 10.0, 0.0, 0.0),
                Srs::LatLon,
                TimeKind::Unix,
            ),
            Resolution::Pixels {
                width: w,
                height: 10,
            },
        )
    }

    #[test]
    fn identical_inputs_give_identical_bytes() {
        let producer = SyntheticProducer::new();
        let sem = SemanticId::from("op/a");
        let a = producer
            .produce(CacheType::Raster, &sem, &rect(0.0, 10.0, 10))
            .expect("produce");
        let b = producer
            .produce(CacheType::Raster, &sem, &rect(0.0, 10.0, 10))
            .expect("produce");
        assert_eq!(a.payload, b.payload);
        assert_eq!(producer.produce_calls(), 2);
    }

    #[test]
    fn different_semantic_ids_differ() {
        let producer = SyntheticProducer::new();
        let a = producer
            .produce(CacheType::Raster, &SemanticId::from("op/a"), &rect(0.0, 10.0, 10))
            .expect("produce");
        let b = producer
            .produce(CacheType::Raster, &SemanticId::from("op/b"), &rect(0.0, 10.0, 10))
            .expect("produce");
        assert_ne!(a.payload, b.payload);
    }

    #[test]
    fn assembly_matches_whole_production_and_is_not_counted() {
        let producer = SyntheticProducer::new();
        let sem = SemanticId::from("op/a");
        let whole = rect(0.0, 10.0, 10);

        let direct = producer
            .produce(CacheType::Raster, &sem, &whole)
            .expect("produce");
        let calls = producer.produce_calls();

        let left = producer
            .produce(CacheType::Raster, &sem, &whole.sub_rect(
                Cube3::from_ranges(0.0, 5.0, 0.0, 10.0, 0.0, 0.0),
            ))
            .expect("produce");
        let assembled = producer
            .assemble(
                CacheType::Raster,
                &sem,
                &whole,
                &[Part {
                    bounds: left.bounds,
                    payload: left.payload,
                }],
            )
            .expect("assemble");
        assert_eq!(assembled.payload, direct.payload);
        assert_eq!(producer.produce_calls(), calls + 1); // only the sub-rect
    }

    #[test]
    fn failing_sources_error() {
        let producer = SyntheticProducer::new();
        assert!(producer
            .produce(
                CacheType::Raster,
                &SemanticId::from("fail/x"),
                &rect(0.0, 1.0, 4)
            )
            .is_err());
    }
}
