//! Caller-pluggable filter hook (§6.3): an opaque correction stage wired
//! into the data path right after fusion and right before the notification
//! gate. Fed one sparse spherical sample per tick via `add`; `compute` may
//! return a corrected sample or `None` to let the tick pass through
//! unmodified. `close` releases whatever state the engine is holding when
//! the owning peer session tears down.
//!
//! No positioning math lives in this crate (accuracy claims are out of
//! scope) — `PassthroughFilter` is the only implementation shipped here.

use ranging_wire::{Measurement, RangingData};

/// One tick's worth of input to the filter, any field absent if that
/// component wasn't measured this round.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SparseSpherical {
    pub azimuth: Option<f64>,
    pub elevation: Option<f64>,
    pub distance: Option<f64>,
}

/// A corrected sample the engine is confident enough in to emit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spherical {
    pub azimuth: f64,
    pub elevation: f64,
    pub distance: f64,
}

pub trait FilterEngine: Send + Sync {
    fn add(&mut self, sample: SparseSpherical);
    fn compute(&mut self) -> Option<Spherical>;
    fn close(&mut self);
}

/// Default filter: never produces a correction, so `compute` always passes
/// the tick through unmodified.
#[derive(Default)]
pub struct PassthroughFilter;

impl FilterEngine for PassthroughFilter {
    fn add(&mut self, _sample: SparseSpherical) {}

    fn compute(&mut self) -> Option<Spherical> {
        None
    }

    fn close(&mut self) {}
}

/// Feeds `data` into `filter` and applies any correction it produces.
/// Engine-supplied fields get `error = 0.0` and `confidence = 0.0` (§6.3) —
/// the engine's contract doesn't carry those, only a corrected value.
pub fn apply(filter: &mut dyn FilterEngine, data: RangingData) -> RangingData {
    filter.add(SparseSpherical {
        azimuth: data.azimuth.map(|m| m.value),
        elevation: data.elevation.map(|m| m.value),
        distance: data.distance.map(|m| m.value),
    });
    match filter.compute() {
        Some(corrected) => RangingData {
            azimuth: Some(engine_measurement(corrected.azimuth)),
            elevation: Some(engine_measurement(corrected.elevation)),
            distance: Some(engine_measurement(corrected.distance)),
            ..data
        },
        None => data,
    }
}

fn engine_measurement(value: f64) -> Measurement {
    Measurement {
        value,
        error: 0.0,
        confidence: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranging_wire::{DeviceId, TechnologyTag};

    fn sample() -> RangingData {
        RangingData {
            peer: DeviceId::new(1),
            technology: TechnologyTag::Uwb,
            distance: Some(Measurement {
                value: 1.0,
                error: 0.1,
                confidence: 0.5,
            }),
            azimuth: None,
            elevation: None,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn passthrough_leaves_the_sample_untouched() {
        let mut filter = PassthroughFilter;
        let data = sample();
        let out = apply(&mut filter, data);
        assert_eq!(out, data);
    }

    struct FixedCorrection(Spherical);

    impl FilterEngine for FixedCorrection {
        fn add(&mut self, _sample: SparseSpherical) {}
        fn compute(&mut self) -> Option<Spherical> {
            Some(self.0)
        }
        fn close(&mut self) {}
    }

    #[test]
    fn a_correcting_engine_overwrites_values_with_zeroed_confidence() {
        let mut filter = FixedCorrection(Spherical {
            azimuth: 10.0,
            elevation: 20.0,
            distance: 2.5,
        });
        let out = apply(&mut filter, sample());
        assert_eq!(out.distance.unwrap().value, 2.5);
        assert_eq!(out.distance.unwrap().error, 0.0);
        assert_eq!(out.distance.unwrap().confidence, 0.0);
        assert_eq!(out.azimuth.unwrap().value, 10.0);
    }
}
