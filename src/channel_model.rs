//! # Channel Model Module
//!
//! Classification and memory for the 40 fixture channels.
//!
//! A channel is untracked, normal (must be held at check time), or latch
//! (must have been pressed at least once since the last CLEAN / MONITOR).
//! Once a latch channel latches it becomes ignored: excluded from the LED
//! policy and from voting until the model is cleaned or the channel is
//! reclassified. Classification is an enum, so a channel can never be both
//! normal and latch.

use embassy_time::Instant;

use crate::debounce::Debouncer;
use crate::CHANNEL_COUNT;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChannelClass {
    Untracked,
    Normal,
    Latch,
}

/// Per-channel state: classification, latch memory, debounce filter, and the
/// telemetry baselines used for EV delta streaming.
#[derive(Clone, Copy, Debug)]
pub struct ChannelState {
    pub class: ChannelClass,
    pub latched: bool,
    pub ignored: bool,
    pub debounce: Debouncer,
    pub prev_pressed: bool,
    pub prev_latched: bool,
    pub last_ev_pressed: Option<Instant>,
    pub last_ev_latched: Option<Instant>,
}

impl ChannelState {
    fn new(raw_pressed: bool, now: Instant) -> Self {
        ChannelState {
            class: ChannelClass::Untracked,
            latched: false,
            ignored: false,
            debounce: Debouncer::new(raw_pressed, now),
            prev_pressed: raw_pressed,
            prev_latched: false,
            last_ev_pressed: None,
            last_ev_latched: None,
        }
    }

    pub fn tracked(&self) -> bool {
        self.class != ChannelClass::Untracked
    }

    fn reset(&mut self, raw_pressed: bool, now: Instant) {
        self.class = ChannelClass::Untracked;
        self.latched = false;
        self.ignored = false;
        self.debounce.reseed(raw_pressed, now);
    }
}

pub struct ChannelModel {
    states: [ChannelState; CHANNEL_COUNT],
}

impl ChannelModel {
    /// Builds the model with every debouncer seeded from a fresh raw read.
    pub fn new<F: FnMut(usize) -> bool>(mut read_pressed: F, now: Instant) -> Self {
        ChannelModel {
            states: core::array::from_fn(|ch| ChannelState::new(read_pressed(ch), now)),
        }
    }

    pub fn state(&self, ch: usize) -> &ChannelState {
        &self.states[ch]
    }

    pub fn state_mut(&mut self, ch: usize) -> &mut ChannelState {
        &mut self.states[ch]
    }

    /// Assigns a tracked class to a channel and returns the LED level to show.
    ///
    /// Newly tracked channels and class changes clear the latch memory and
    /// reseed the debouncer from the given raw read; re-asserting the same
    /// class leaves the memory alone (additive MONITOR mid-session).
    pub fn assign(
        &mut self,
        ch: usize,
        class: ChannelClass,
        raw_pressed: bool,
        now: Instant,
    ) -> bool {
        debug_assert!(class != ChannelClass::Untracked);
        let st = &mut self.states[ch];
        let fresh = !st.tracked() || st.class != class;
        if fresh {
            st.latched = false;
            st.ignored = false;
            st.debounce.reseed(raw_pressed, now);
        }
        st.class = class;
        match class {
            ChannelClass::Latch => !st.latched,
            _ => true,
        }
    }

    /// Resets every channel to untracked and reseeds the debouncers.
    pub fn clean<F: FnMut(usize) -> bool>(&mut self, mut read_pressed: F, now: Instant) {
        for (ch, st) in self.states.iter_mut().enumerate() {
            st.reset(read_pressed(ch), now);
        }
    }

    /// `true` when every latch channel has latched (vacuously true with none).
    pub fn all_latch_latched(&self) -> bool {
        self.states
            .iter()
            .all(|st| st.class != ChannelClass::Latch || st.latched)
    }

    /// `true` when every normal, non-ignored channel is currently held.
    pub fn normals_held(&self) -> bool {
        self.states.iter().all(|st| {
            st.class != ChannelClass::Normal || st.ignored || st.debounce.stable()
        })
    }

    /// Whether an evaluation would have anything to look at.
    ///
    /// With a selection, any selected non-ignored channel counts; without one,
    /// any tracked non-ignored channel does.
    pub fn has_work(&self, selection: Option<&[bool; CHANNEL_COUNT]>) -> bool {
        match selection {
            Some(select) => self
                .states
                .iter()
                .zip(select.iter())
                .any(|(st, sel)| *sel && !st.ignored),
            None => self.states.iter().any(|st| st.tracked() && !st.ignored),
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn released(_: usize) -> bool {
        false
    }

    #[test]
    fn latch_memory_holds_until_clean() {
        let mut model = ChannelModel::new(released, t(0));
        model.assign(2, ChannelClass::Latch, false, t(0));
        let st = model.state_mut(2);
        st.latched = true;
        st.ignored = true;
        assert!(model.all_latch_latched());

        // Re-asserting the same class keeps the memory.
        let led = model.assign(2, ChannelClass::Latch, false, t(10));
        assert!(model.state(2).latched);
        assert!(!led);

        model.clean(released, t(20));
        assert!(!model.state(2).latched);
        assert!(!model.state(2).ignored);
        assert_eq!(model.state(2).class, ChannelClass::Untracked);
    }

    #[test]
    fn reclassification_clears_latch_and_ignore() {
        let mut model = ChannelModel::new(released, t(0));
        model.assign(5, ChannelClass::Latch, false, t(0));
        model.state_mut(5).latched = true;
        model.state_mut(5).ignored = true;

        let led = model.assign(5, ChannelClass::Normal, false, t(10));
        assert!(led);
        assert_eq!(model.state(5).class, ChannelClass::Normal);
        assert!(!model.state(5).latched);
        assert!(!model.state(5).ignored);
    }

    #[test]
    fn reclassification_reseeds_a_held_switch() {
        let mut model = ChannelModel::new(released, t(0));
        // Switch already held when the channel becomes a latch: no phantom edge.
        model.assign(7, ChannelClass::Latch, true, t(0));
        let (stable, edge) = model.state_mut(7).debounce.update(true, t(100));
        assert!(stable);
        assert!(!edge);
    }

    #[test]
    fn predicates_respect_ignored_channels() {
        let mut model = ChannelModel::new(released, t(0));
        model.assign(0, ChannelClass::Normal, false, t(0));
        model.assign(1, ChannelClass::Latch, false, t(0));
        assert!(!model.all_latch_latched());
        assert!(!model.normals_held());
        assert!(model.has_work(None));

        model.state_mut(1).latched = true;
        model.state_mut(1).ignored = true;
        assert!(model.all_latch_latched());

        // The only selected channel is ignored: nothing to evaluate.
        let mut select = [false; CHANNEL_COUNT];
        select[1] = true;
        assert!(!model.has_work(Some(&select)));
        select[0] = true;
        assert!(model.has_work(Some(&select)));
    }
}
