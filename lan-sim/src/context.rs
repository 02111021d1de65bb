use crate::network::frame::{Frame, FramePayload};
use crate::network::mac::MacAddress;
use crate::tracing::tracer::SimulationStepTracer;
use anyhow::bail;
use fastrand::Rng;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// State shared by every engine of a single simulated network
pub struct SimulationContext {
    pub(crate) tracer: Arc<SimulationStepTracer>,
    speed: SimulationSpeed,
    rng: Mutex<Rng>,
    next_frame_number: AtomicU64,
}

impl SimulationContext {
    pub fn new(tracer: Arc<SimulationStepTracer>, rng: Rng) -> Self {
        Self {
            tracer,
            speed: SimulationSpeed::new(),
            rng: Mutex::new(rng),
            next_frame_number: AtomicU64::new(0),
        }
    }

    pub fn tracer(&self) -> &Arc<SimulationStepTracer> {
        &self.tracer
    }

    pub fn speed(&self) -> &SimulationSpeed {
        &self.speed
    }

    /// Scales a simulated duration (cable delay, protocol timer) by the global speed factor
    pub fn scaled(&self, duration: Duration) -> Duration {
        let factor = self.speed.factor();
        if factor == 1.0 {
            duration
        } else {
            duration.mul_f64(factor)
        }
    }

    pub(crate) fn frame(
        &self,
        source: MacAddress,
        destination: MacAddress,
        payload: FramePayload,
    ) -> Frame {
        let id = Uuid::from_u128(self.rng.lock().u128(..));
        Frame {
            id,
            number: self.next_frame_number.fetch_add(1, Ordering::Relaxed),
            source,
            destination,
            payload,
        }
    }

    pub(crate) fn random_u32(&self) -> u32 {
        self.rng.lock().u32(..)
    }

    pub(crate) fn random_u16(&self) -> u16 {
        self.rng.lock().u16(..)
    }

    pub(crate) fn random_mac(&self) -> MacAddress {
        let mut rng = self.rng.lock();
        MacAddress::random(&mut rng)
    }
}

/// The global speed factor, applied to every cable delay and protocol timer
///
/// A factor of 2.0 makes the simulation run twice as slow. The value is read on every transmit,
/// so changes take effect for frames sent afterwards.
pub struct SimulationSpeed {
    factor_bits: AtomicU64,
}

impl SimulationSpeed {
    fn new() -> Self {
        Self {
            factor_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    pub fn factor(&self) -> f64 {
        f64::from_bits(self.factor_bits.load(Ordering::Relaxed))
    }

    pub fn set_factor(&self, factor: f64) -> anyhow::Result<()> {
        if !factor.is_finite() || factor <= 0.0 {
            bail!("speed factor must be a positive number (got {factor})");
        }

        self.factor_bits.store(factor.to_bits(), Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pcap_exporter::NoOpPcapExporterFactory;

    #[test]
    fn test_speed_factor_scales_durations() {
        let context = SimulationContext::new(
            Arc::new(SimulationStepTracer::new(Arc::new(NoOpPcapExporterFactory))),
            Rng::with_seed(42),
        );

        assert_eq!(
            context.scaled(Duration::from_millis(10)),
            Duration::from_millis(10)
        );

        context.speed().set_factor(2.5).unwrap();
        assert_eq!(
            context.scaled(Duration::from_millis(10)),
            Duration::from_millis(25)
        );

        assert!(context.speed().set_factor(0.0).is_err());
        assert!(context.speed().set_factor(f64::NAN).is_err());
        assert_eq!(context.speed().factor(), 2.5);
    }
}
