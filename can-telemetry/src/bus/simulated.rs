//! Synthetic frame sources
//!
//! `SimulatedBus` turns a [`FrameGenerator`] into a [`BusBackend`]. With a
//! period set, frames become available at that rate and queue up between
//! polls like they would in a socket buffer.

use super::BusBackend;
use crate::types::{now_ns, BusError, RawFrame};
use std::time::{Duration, Instant};

/// Frames a bus may hold before older ones are dropped
const MAX_BACKLOG: u32 = 256;

/// Longest accepted frame period
const MAX_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Produces the frame sequence of a simulated bus
pub trait FrameGenerator: Send {
    /// Frame number `sequence` (0-based), or `None` once the sequence is exhausted
    fn next_frame(&mut self, sequence: u64) -> Option<RawFrame>;
}

impl<F> FrameGenerator for F
where
    F: FnMut(u64) -> Option<RawFrame> + Send,
{
    fn next_frame(&mut self, sequence: u64) -> Option<RawFrame> {
        self(sequence)
    }
}

/// Bus backend fed by a generator
pub struct SimulatedBus {
    name: String,
    generator: Box<dyn FrameGenerator>,
    sequence: u64,
    period: Option<Duration>,
    next_due: Option<Instant>,
    exhausted: bool,
}

impl SimulatedBus {
    pub fn new(generator: impl FrameGenerator + 'static) -> Self {
        Self {
            name: "virtual".to_string(),
            generator: Box::new(generator),
            sequence: 0,
            period: None,
            next_due: None,
            exhausted: false,
        }
    }

    /// Release one frame per `period` instead of one per poll.
    /// Periods above one day are clamped.
    pub fn with_period(mut self, period: Duration) -> Self {
        if period > MAX_PERIOD {
            log::warn!("{}: period {:?} clamped to {:?}", self.name, period, MAX_PERIOD);
        }
        self.period = (!period.is_zero()).then_some(period.min(MAX_PERIOD));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Frames handed out so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait until the next frame is due. Returns false if that is beyond `timeout`.
    fn wait_for_slot(&mut self, period: Duration, timeout: Duration) -> bool {
        let now = Instant::now();
        let due = *self.next_due.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return false;
            }
            std::thread::sleep(wait);
        }

        let mut next = due.checked_add(period).unwrap_or(due);
        if let Some(oldest) = period
            .checked_mul(MAX_BACKLOG)
            .and_then(|backlog| Instant::now().checked_sub(backlog))
        {
            next = next.max(oldest);
        }
        self.next_due = Some(next);
        true
    }
}

impl BusBackend for SimulatedBus {
    fn poll(&mut self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        if self.exhausted {
            std::thread::sleep(timeout);
            return Ok(None);
        }

        if let Some(period) = self.period {
            if !self.wait_for_slot(period, timeout) {
                return Ok(None);
            }
        }

        match self.generator.next_frame(self.sequence) {
            Some(frame) => {
                self.sequence += 1;
                Ok(Some(frame))
            }
            None => {
                log::debug!("{}: generator exhausted after {} frames", self.name, self.sequence);
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Plays back a fixed list of frames
///
/// Looped playback restamps frames with the current time after the first pass.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    frames: Vec<RawFrame>,
    looped: bool,
}

impl ScriptedGenerator {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self { frames, looped: false }
    }

    pub fn looped(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameGenerator for ScriptedGenerator {
    fn next_frame(&mut self, sequence: u64) -> Option<RawFrame> {
        let len = self.frames.len() as u64;
        if len == 0 {
            return None;
        }
        if sequence < len {
            return self.frames.get(sequence as usize).cloned();
        }
        if !self.looped {
            return None;
        }
        self.frames
            .get((sequence % len) as usize)
            .map(|frame| frame.clone().with_timestamp_ns(now_ns()))
    }
}

/// Demo traffic matching the bundled databases
///
/// Cycles through engine speed (0x0C1), vehicle speed (0x0C2) and coolant
/// temperature (0x0C3) with slowly advancing values. Optionally injects a
/// J1939 DM1 frame reporting SPN 110 FMI 0 every `fault_every` frames.
#[derive(Debug, Clone)]
pub struct DemoGenerator {
    fault_every: Option<u64>,
}

impl Default for DemoGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoGenerator {
    pub const ENGINE_SPEED_ID: u32 = 0x0C1;
    pub const VEHICLE_SPEED_ID: u32 = 0x0C2;
    pub const COOLANT_TEMP_ID: u32 = 0x0C3;
    pub const DM1_ID: u32 = 0x18FE_CA00;

    pub fn new() -> Self {
        Self { fault_every: Some(300) }
    }

    /// Change or disable (`None`) fault injection
    pub fn with_fault_every(mut self, frames: Option<u64>) -> Self {
        self.fault_every = frames.filter(|&n| n > 0);
        self
    }

    fn engine_speed(tick: u64) -> RawFrame {
        // 800..4000 rpm, 1 rpm/bit, big-endian
        let rpm = 800 + ((tick * 25) % 3200) as u16;
        let [hi, lo] = rpm.to_be_bytes();
        RawFrame::new(Self::ENGINE_SPEED_ID, vec![hi, lo, 0, 0, 0, 0, 0, 0])
    }

    fn vehicle_speed(tick: u64) -> RawFrame {
        let kph = (tick % 130) as u8;
        RawFrame::new(Self::VEHICLE_SPEED_ID, vec![kph, 0, 0, 0, 0, 0, 0, 0])
    }

    fn coolant_temp(tick: u64) -> RawFrame {
        // Offset -40 degC
        let raw = 40 + 70 + ((tick / 20) % 30) as u8;
        RawFrame::new(Self::COOLANT_TEMP_ID, vec![raw, 0, 0, 0, 0, 0, 0, 0])
    }

    fn dm1_fault() -> RawFrame {
        // Amber lamp, SPN 110 FMI 0, OC 1
        RawFrame::new(Self::DM1_ID, vec![0x04, 0xFF, 0x6E, 0x00, 0x00, 0x01, 0xFF, 0xFF])
    }
}

impl FrameGenerator for DemoGenerator {
    fn next_frame(&mut self, sequence: u64) -> Option<RawFrame> {
        if let Some(every) = self.fault_every {
            if sequence > 0 && sequence % every == 0 {
                return Some(Self::dm1_fault());
            }
        }

        let tick = sequence / 3;
        Some(match sequence % 3 {
            0 => Self::engine_speed(tick),
            1 => Self::vehicle_speed(tick),
            _ => Self::coolant_temp(tick),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_generator() {
        let mut bus = SimulatedBus::new(|seq: u64| (seq < 2).then(|| RawFrame::new(0x200 + seq as u32, vec![])));
        assert_eq!(bus.poll(Duration::ZERO).unwrap().unwrap().can_id, 0x200);
        assert_eq!(bus.poll(Duration::ZERO).unwrap().unwrap().can_id, 0x201);
        assert!(bus.poll(Duration::ZERO).unwrap().is_none());
        assert!(bus.poll(Duration::ZERO).unwrap().is_none());
        assert_eq!(bus.sequence(), 2);
    }

    #[test]
    fn test_huge_period_is_clamped() {
        let mut bus = SimulatedBus::new(|seq: u64| Some(RawFrame::new(0x300 + seq as u32, vec![])))
            .with_period(Duration::from_millis(u64::MAX));

        assert_eq!(bus.poll(Duration::ZERO).unwrap().unwrap().can_id, 0x300);
        assert!(bus.poll(Duration::ZERO).unwrap().is_none());
        assert!(bus.poll(Duration::from_millis(5)).unwrap().is_none());
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn test_scripted_loop_restamps() {
        let frame = RawFrame::new(0x123, vec![1]).with_timestamp_ns(1_000);
        let mut generator = ScriptedGenerator::new(vec![frame]).looped(true);

        assert_eq!(generator.next_frame(0).unwrap().timestamp_ns, 1_000);
        let again = generator.next_frame(1).unwrap();
        assert_eq!(again.can_id, 0x123);
        assert!(again.timestamp_ns > 1_000);

        let mut once = ScriptedGenerator::new(vec![RawFrame::new(0x1, vec![])]);
        assert!(once.next_frame(1).is_none());
        assert!(ScriptedGenerator::default().next_frame(0).is_none());
    }

    #[test]
    fn test_period_limits_rate() {
        let mut bus = SimulatedBus::new(DemoGenerator::new()).with_period(Duration::from_millis(50));

        // First frame is due immediately, the second is not
        assert!(bus.poll(Duration::ZERO).unwrap().is_some());
        assert!(bus.poll(Duration::ZERO).unwrap().is_none());

        // Waiting long enough releases it
        assert!(bus.poll(Duration::from_millis(200)).unwrap().is_some());
    }

    #[test]
    fn test_demo_cycle() {
        let mut generator = DemoGenerator::new().with_fault_every(None);
        let ids: Vec<u32> = (0..6).map(|seq| generator.next_frame(seq).unwrap().can_id).collect();
        assert_eq!(ids, vec![0x0C1, 0x0C2, 0x0C3, 0x0C1, 0x0C2, 0x0C3]);

        let rpm = generator.next_frame(0).unwrap();
        assert_eq!(&rpm.data[..2], &800u16.to_be_bytes());
        let rpm = generator.next_frame(3).unwrap();
        assert_eq!(&rpm.data[..2], &825u16.to_be_bytes());
    }

    #[test]
    fn test_demo_fault_injection() {
        let mut generator = DemoGenerator::new().with_fault_every(Some(4));
        assert_eq!(generator.next_frame(0).unwrap().can_id, DemoGenerator::ENGINE_SPEED_ID);
        let fault = generator.next_frame(4).unwrap();
        assert_eq!(fault.can_id, DemoGenerator::DM1_ID);
        assert!(fault.is_extended);
    }
}
