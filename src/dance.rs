//! Tap-dance resolution.
//!
//! A dance key cannot be reported when it is pressed, because its meaning
//! depends on what happens next. Another tap of the same key extends the
//! sequence; any other key, or the timeout, resolves it. The engine
//! therefore consumes the dance key's own events, counts taps, and defers
//! the decision until one of those happens. Every other key on the board
//! flows through undelayed, so the engine has to keep the host-visible
//! ordering of the two streams consistent:
//!
//! - When an unrelated key interrupts a pending sequence, the sequence's
//!   resolved output is injected, flushed to the host, and released
//!   before the interrupting key's own report goes out.
//! - An ordinary interrupting key's address is masked for the rest of the
//!   cycle so a bounce or same-cycle release cannot be counted against the
//!   report that was just forced out. A dance key that interrupts is never
//!   masked, since it becomes the new sequence and its release must stay
//!   visible to the engine.
//! - Releases of resolved keys are queued and drained in arrival order at
//!   one fixed point per cycle, never inline.
//!
//! Only one sequence is in progress at any time. Per-key state lives in a
//! fixed arena owned by the engine; what each resolution *does* is decided
//! by a [`DanceHandler`] strategy, normally the table-driven
//! [`TableDance`].

use arraydeque::ArrayDeque;
use arrayvec::ArrayVec;

use crate::dispatch::{EventContext, EventResult, Plugin};
use crate::log::{info, warn};
use crate::{Key, KeyAddr, KeyEvent, KeyState};

/// Arena slots: the most dance keys a keymap can configure.
pub const MAX_DANCE_KEYS: usize = 16;

/// Longest configurable tap sequence for one key.
pub const MAX_TAPS: usize = 8;

/// Releases finalized in one cycle but not yet reported.
const PENDING_CAP: usize = 8;

/// Window after the last tap before the sequence resolves on its own.
pub const DEFAULT_TIMEOUT_MS: u16 = 200;

/// Why the handler is being invoked for a dance key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DanceKind {
    /// The key was tapped again; the sequence is still open.
    Tap,
    /// The sequence resolved and the key is still physically held.
    Hold,
    /// A different key arrived before the window closed.
    Interrupt,
    /// The window closed with no further input.
    Timeout,
    /// The sequence is over and the key is up; emit the final release.
    Release,
}

/// One logical transition of a dance key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dance {
    /// Index into the dance key configuration.
    pub index: u8,
    /// Physical position the sequence started from.
    pub addr: KeyAddr,
    /// Taps counted so far; saturates at the handler's `max_taps`.
    pub count: u8,
    pub kind: DanceKind,
}

/// Strategy invoked exactly once per logical transition.
///
/// Handlers own no resolution state; everything they need arrives in the
/// [`Dance`] value, and anything they emit goes through the context.
pub trait DanceHandler {
    fn on_dance(&mut self, ctx: &mut EventContext<'_>, dance: &Dance);

    /// Highest meaningful tap count for a key; counting saturates here.
    fn max_taps(&self, _index: u8) -> u8 {
        u8::MAX
    }

    /// Whether this index is configured. Events for unconfigured indices
    /// pass through the engine untouched.
    fn configured(&self, _index: u8) -> bool {
        true
    }
}

/// The always-available do-nothing strategy. Dance keys are still counted
/// and consumed, they just produce no output.
#[derive(Default)]
pub struct NoopDance;

impl DanceHandler for NoopDance {
    fn on_dance(&mut self, _ctx: &mut EventContext<'_>, _dance: &Dance) {}
}

/// Table-driven strategy: each dance key maps tap counts to output keys.
///
/// Tapping n times emits the n-th entry; sequences longer than the table
/// saturate on the last entry. Interrupt and timeout inject a press of the
/// selected key, hold re-injects it held every cycle so it stays in each
/// rebuilt report, and release flushes before injecting the key-up so a
/// terminated hold is visible promptly.
#[derive(Default)]
pub struct TableDance {
    keys: ArrayVec<ArrayVec<Key, MAX_TAPS>, MAX_DANCE_KEYS>,
}

impl TableDance {
    pub fn new() -> Self {
        TableDance { keys: ArrayVec::new() }
    }

    /// Append the output table for the next dance index.
    pub fn key(mut self, outputs: &[Key]) -> Self {
        let mut row = ArrayVec::new();
        for output in outputs {
            if row.try_push(*output).is_err() {
                warn!("dance table: output list truncated");
                break;
            }
        }
        if self.keys.try_push(row).is_err() {
            warn!("dance table: too many dance keys, entry ignored");
        }
        self
    }
}

impl DanceHandler for TableDance {
    fn on_dance(&mut self, ctx: &mut EventContext<'_>, dance: &Dance) {
        let Some(row) = self.keys.get(dance.index as usize) else {
            return;
        };
        if row.is_empty() {
            return;
        }
        let pick = (dance.count.max(1) as usize).min(row.len()) - 1;
        let key = row[pick];

        match dance.kind {
            DanceKind::Tap => (),
            DanceKind::Interrupt | DanceKind::Timeout => {
                ctx.inject(KeyEvent::new(dance.addr, key, KeyState::press()));
            }
            DanceKind::Hold => {
                ctx.inject(KeyEvent::new(dance.addr, key, KeyState::hold()));
            }
            DanceKind::Release => {
                ctx.flush();
                ctx.inject(KeyEvent::new(dance.addr, key, KeyState::release()));
            }
        }
    }

    fn max_taps(&self, index: u8) -> u8 {
        match self.keys.get(index as usize) {
            Some(row) if !row.is_empty() => row.len() as u8,
            _ => 1,
        }
    }

    fn configured(&self, index: u8) -> bool {
        (index as usize) < self.keys.len()
    }
}

/// Per-key slot in the engine's arena.
#[derive(Clone, Copy, Default)]
struct DanceState {
    /// Taps counted for the sequence in progress (or just finished).
    count: u8,
    /// The key is physically down.
    pressed: bool,
    /// A decision has been emitted; only the release is outstanding.
    triggered: bool,
    /// A finalized release is queued but not yet drained.
    release_pending: bool,
    /// Hold already emitted this cycle.
    hold_sent: bool,
}

#[derive(Clone, Copy)]
struct Active {
    index: u8,
    addr: KeyAddr,
}

#[derive(Clone, Copy)]
struct PendingRelease {
    index: u8,
    addr: KeyAddr,
    /// Captured when the sequence was finalized; a restarted sequence on
    /// the same key cannot disturb it.
    count: u8,
}

/// The resolution engine. Registers as an ordinary [`Plugin`].
pub struct DanceManager<H> {
    handler: H,
    timeout: u16,
    states: [DanceState; MAX_DANCE_KEYS],
    active: Option<Active>,
    /// When the window opened; compared against the cycle timestamp.
    timer: Option<u32>,
    pending: ArrayDeque<PendingRelease, PENDING_CAP>,
}

impl Default for DanceManager<NoopDance> {
    fn default() -> Self {
        DanceManager::new(NoopDance)
    }
}

impl<H: DanceHandler> DanceManager<H> {
    pub fn new(handler: H) -> Self {
        Self::with_timeout(handler, DEFAULT_TIMEOUT_MS)
    }

    pub fn with_timeout(handler: H, timeout: u16) -> Self {
        DanceManager {
            handler,
            timeout,
            states: [DanceState::default(); MAX_DANCE_KEYS],
            active: None,
            timer: None,
            pending: ArrayDeque::new(),
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Index of the sequence in progress, if any.
    pub fn active(&self) -> Option<u8> {
        self.active.map(|a| a.index)
    }

    /// Current tap count of a dance key. Zero once its release drained.
    pub fn tap_count(&self, index: u8) -> u8 {
        self.states
            .get(index as usize)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    /// Begin a new sequence on a freshly pressed dance key.
    fn begin(&mut self, ctx: &mut EventContext<'_>, index: u8, addr: KeyAddr) -> EventResult {
        self.active = Some(Active { index, addr });
        self.states[index as usize].pressed = true;
        self.tap(ctx, index, addr);
        EventResult::Consumed
    }

    /// Count one tap and re-arm the timeout window.
    fn tap(&mut self, ctx: &mut EventContext<'_>, index: u8, addr: KeyAddr) {
        let max = self.handler.max_taps(index).max(1);
        let state = &mut self.states[index as usize];
        if state.count < max {
            state.count += 1;
        }
        let count = state.count;
        self.timer = Some(ctx.now());
        self.handler.on_dance(
            ctx,
            &Dance { index, addr, count, kind: DanceKind::Tap },
        );
    }

    /// Resolve the active sequence because some other key arrived.
    ///
    /// The resolved output must reach the host before the interrupting
    /// key does, so the report is flushed and emptied here, between the
    /// two. Masking the interrupter is the caller's business: only a key
    /// the engine will not track again may be suppressed.
    fn interrupt(&mut self, ctx: &mut EventContext<'_>) {
        let Some(Active { index, addr }) = self.active.take() else {
            return;
        };
        self.timer = None;
        let state = &mut self.states[index as usize];
        state.triggered = true;
        let count = state.count;

        info!("dance {}: interrupted at {} taps", index, count);
        self.handler.on_dance(
            ctx,
            &Dance { index, addr, count, kind: DanceKind::Interrupt },
        );
        ctx.flush();
        ctx.release_all();

        if !self.states[index as usize].pressed {
            self.finish(ctx, index, addr);
        }
    }

    /// Resolve the active sequence because the window closed.
    fn fire_timeout(&mut self, ctx: &mut EventContext<'_>) {
        let Some(Active { index, addr }) = self.active.take() else {
            return;
        };
        self.timer = None;
        let state = &mut self.states[index as usize];
        state.triggered = true;
        let count = state.count;

        info!("dance {}: timeout at {} taps", index, count);
        self.handler.on_dance(
            ctx,
            &Dance { index, addr, count, kind: DanceKind::Timeout },
        );

        if !self.states[index as usize].pressed {
            self.finish(ctx, index, addr);
        }
    }

    /// Finalize a sequence: capture the count, queue the release.
    ///
    /// Idempotent: a second call with no toggled-on in between finds
    /// nothing outstanding and does nothing. If the pending queue is
    /// full, the oldest queued release fires immediately instead of
    /// anything being dropped or reordered.
    fn finish(&mut self, ctx: &mut EventContext<'_>, index: u8, addr: KeyAddr) {
        let count;
        {
            let state = &mut self.states[index as usize];
            if state.release_pending {
                return;
            }
            if state.count == 0 && !state.triggered {
                return;
            }
            state.triggered = false;
            state.release_pending = true;
            count = state.count;
            state.count = 0;
        }
        if matches!(self.active, Some(a) if a.index == index) {
            self.active = None;
            self.timer = None;
        }

        let entry = PendingRelease { index, addr, count };
        if let Err(err) = self.pending.push_back(entry) {
            warn!("dance: pending queue full, draining oldest early");
            if let Some(oldest) = self.pending.pop_front() {
                self.emit_release(ctx, oldest);
            }
            let _ = self.pending.push_back(err.element);
        }
    }

    fn emit_release(&mut self, ctx: &mut EventContext<'_>, entry: PendingRelease) {
        self.states[entry.index as usize].release_pending = false;
        self.handler.on_dance(
            ctx,
            &Dance {
                index: entry.index,
                addr: entry.addr,
                count: entry.count,
                kind: DanceKind::Release,
            },
        );
    }
}

impl<H: DanceHandler> Plugin for DanceManager<H> {
    fn before_cycle(&mut self, _ctx: &mut EventContext<'_>) {
        for state in self.states.iter_mut() {
            state.hold_sent = false;
        }
    }

    fn on_key_event(
        &mut self,
        event: &mut KeyEvent,
        ctx: &mut EventContext<'_>,
    ) -> EventResult {
        // The engine's own output re-enters the pipeline; touching it
        // again would double-process the decision.
        if event.state.injected {
            return EventResult::Continue;
        }

        let index = match event.key {
            Key::Dance(i) if (i as usize) < MAX_DANCE_KEYS && self.handler.configured(i) => i,
            _ => {
                // Not ours. A fresh press cuts any pending sequence
                // short; the event itself is never withheld, but its
                // address is masked so a same-cycle bounce or release
                // cannot be counted against the report just forced out.
                if self.active.is_some() && event.state.toggled_on() {
                    self.interrupt(ctx);
                    ctx.mask(event.addr);
                }
                return EventResult::Continue;
            }
        };
        let slot = index as usize;

        if event.state.toggled_off() {
            self.states[slot].pressed = false;
        }

        match self.active {
            Some(Active { index: owner, .. }) if owner == index => {
                if event.state.toggled_off() {
                    // Sequence stays open: the same key may come back
                    // down before the window closes.
                    return EventResult::Consumed;
                }
                self.active = Some(Active { index, addr: event.addr });
                self.states[slot].pressed = true;
                if event.state.toggled_on() {
                    self.tap(ctx, index, event.addr);
                }
                EventResult::Consumed
            }
            Some(_) => {
                if event.state.toggled_off() {
                    if self.states[slot].count != 0 {
                        self.finish(ctx, index, event.addr);
                    }
                    return EventResult::Consumed;
                }
                if !event.state.toggled_on() {
                    return EventResult::Consumed;
                }
                // A second dance key both interrupts the active sequence
                // and starts its own. It is not masked: the engine keeps
                // tracking it, and its release must stay visible.
                self.interrupt(ctx);
                self.begin(ctx, index, event.addr)
            }
            None => {
                if self.states[slot].triggered {
                    if event.state.toggled_off() {
                        self.finish(ctx, index, event.addr);
                    } else if event.state.held() && !self.states[slot].hold_sent {
                        self.states[slot].hold_sent = true;
                        let count = self.states[slot].count;
                        self.handler.on_dance(
                            ctx,
                            &Dance {
                                index,
                                addr: event.addr,
                                count,
                                kind: DanceKind::Hold,
                            },
                        );
                    }
                    return EventResult::Consumed;
                }
                if event.state.toggled_on() {
                    return self.begin(ctx, index, event.addr);
                }
                // Stray held or release of an idle dance key.
                EventResult::Consumed
            }
        }
    }

    fn after_cycle(&mut self, ctx: &mut EventContext<'_>) {
        // Queued releases drain here, oldest first, exactly once.
        while let Some(entry) = self.pending.pop_front() {
            self.emit_release(ctx, entry);
        }

        // The timeout loses every race on purpose: it is only checked
        // after all of this cycle's real events have been dispatched.
        if let (Some(_), Some(opened)) = (self.active, self.timer) {
            if ctx.now().wrapping_sub(opened) > u32::from(self.timeout) {
                self.fire_timeout(ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Command, STAGE_DEPTH};
    use crate::Keyboard;
    use arrayvec::ArrayVec;

    /// Records every resolution it is handed.
    #[derive(Default)]
    struct Recorder {
        log: Vec<(u8, u8, DanceKind)>,
        max: u8,
    }

    impl DanceHandler for Recorder {
        fn on_dance(&mut self, _ctx: &mut EventContext<'_>, dance: &Dance) {
            self.log.push((dance.index, dance.count, dance.kind));
        }

        fn max_taps(&self, _index: u8) -> u8 {
            self.max
        }
    }

    struct Ctx {
        staged: ArrayVec<Command, STAGE_DEPTH>,
        masked: u64,
        now: u32,
    }

    impl Ctx {
        fn new(now: u32) -> Self {
            Ctx { staged: ArrayVec::new(), masked: 0, now }
        }

        fn get(&mut self) -> EventContext<'_> {
            EventContext::new(self.now, &mut self.staged, &mut self.masked)
        }
    }

    fn dance_press(index: u8, addr: u8) -> KeyEvent {
        KeyEvent::new(KeyAddr::new(addr), Key::Dance(index), KeyState::press())
    }

    fn dance_release(index: u8, addr: u8) -> KeyEvent {
        KeyEvent::new(KeyAddr::new(addr), Key::Dance(index), KeyState::release())
    }

    fn feed(engine: &mut DanceManager<Recorder>, now: u32, event: KeyEvent) -> EventResult {
        let mut ctx = Ctx::new(now);
        let mut event = event;
        engine.on_key_event(&mut event, &mut ctx.get())
    }

    fn end_cycle(engine: &mut DanceManager<Recorder>, now: u32) {
        let mut ctx = Ctx::new(now);
        engine.after_cycle(&mut ctx.get());
    }

    #[test]
    fn tap_count_saturates_at_handler_max() {
        let mut engine = DanceManager::new(Recorder { max: 2, ..Default::default() });

        assert_eq!(feed(&mut engine, 0, dance_press(0, 1)), EventResult::Consumed);
        feed(&mut engine, 10, dance_release(0, 1));
        feed(&mut engine, 20, dance_press(0, 1));
        feed(&mut engine, 30, dance_release(0, 1));
        feed(&mut engine, 40, dance_press(0, 1));

        let taps: Vec<u8> = engine
            .handler()
            .log
            .iter()
            .filter(|(_, _, kind)| *kind == DanceKind::Tap)
            .map(|(_, count, _)| *count)
            .collect();
        assert_eq!(taps, vec![1, 2, 2]);
        assert_eq!(engine.tap_count(0), 2);
    }

    #[test]
    fn timeout_fires_once_and_release_drains_next_cycle() {
        let mut engine =
            DanceManager::with_timeout(Recorder { max: 8, ..Default::default() }, 200);

        feed(&mut engine, 0, dance_press(0, 1));
        feed(&mut engine, 10, dance_release(0, 1));
        // Window still open: nothing resolves.
        end_cycle(&mut engine, 100);
        assert_eq!(engine.active(), Some(0));

        // Window closed: timeout fires, and since the key is up the
        // release is queued in the same pass.
        end_cycle(&mut engine, 201);
        assert_eq!(engine.active(), None);

        // The queued release drains at the next cycle's fixed point.
        end_cycle(&mut engine, 202);
        // A further cycle must not produce anything more.
        end_cycle(&mut engine, 203);

        assert_eq!(
            engine.handler().log,
            vec![
                (0, 1, DanceKind::Tap),
                (0, 1, DanceKind::Timeout),
                (0, 1, DanceKind::Release),
            ]
        );
        assert_eq!(engine.tap_count(0), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let mut engine = DanceManager::new(Recorder { max: 8, ..Default::default() });

        feed(&mut engine, 0, dance_press(0, 1));
        feed(&mut engine, 10, dance_release(0, 1));
        end_cycle(&mut engine, 300);

        // Stray releases of the now-idle key must not fire anything.
        feed(&mut engine, 301, dance_release(0, 1));
        end_cycle(&mut engine, 302);
        feed(&mut engine, 303, dance_release(0, 1));
        end_cycle(&mut engine, 304);

        let releases = engine
            .handler()
            .log
            .iter()
            .filter(|(_, _, kind)| *kind == DanceKind::Release)
            .count();
        assert_eq!(releases, 1);
        assert_eq!(engine.tap_count(0), 0);
    }

    #[test]
    fn pending_queue_fails_open_in_order() {
        let mut engine = DanceManager::new(Recorder { max: 8, ..Default::default() });

        // Tap-and-release key i, then let key i+1 interrupt it; each
        // interrupted key is finalized at the next key's press. One more
        // finalization than the queue holds forces the oldest out early.
        for i in 0..=PENDING_CAP as u8 + 1 {
            feed(&mut engine, 0, dance_press(i, i));
            feed(&mut engine, 0, dance_release(i, i));
        }

        let releases: Vec<u8> = engine
            .handler()
            .log
            .iter()
            .filter(|(_, _, kind)| *kind == DanceKind::Release)
            .map(|(index, _, _)| *index)
            .collect();
        // The overflow drained key 0 immediately; order is preserved.
        assert_eq!(releases, vec![0]);

        end_cycle(&mut engine, 1);
        let releases: Vec<u8> = engine
            .handler()
            .log
            .iter()
            .filter(|(_, _, kind)| *kind == DanceKind::Release)
            .map(|(index, _, _)| *index)
            .collect();
        let expected: Vec<u8> = (0..=PENDING_CAP as u8).collect();
        assert_eq!(releases, expected);
    }

    #[test]
    fn at_most_one_sequence_is_active() {
        let mut engine = DanceManager::new(Recorder { max: 8, ..Default::default() });

        feed(&mut engine, 0, dance_press(0, 1));
        assert_eq!(engine.active(), Some(0));
        // A second dance key takes over the single active slot.
        feed(&mut engine, 10, dance_press(1, 2));
        assert_eq!(engine.active(), Some(1));

        assert_eq!(
            engine.handler().log,
            vec![
                (0, 1, DanceKind::Tap),
                (0, 1, DanceKind::Interrupt),
                (1, 1, DanceKind::Tap),
            ]
        );
    }

    #[test]
    fn unconfigured_dance_index_passes_through() {
        #[derive(Default)]
        struct Narrow(Vec<(u8, u8, DanceKind)>);
        impl DanceHandler for Narrow {
            fn on_dance(&mut self, _ctx: &mut EventContext<'_>, dance: &Dance) {
                self.0.push((dance.index, dance.count, dance.kind));
            }
            fn configured(&self, index: u8) -> bool {
                index == 0
            }
        }

        let mut engine = DanceManager::new(Narrow::default());
        let mut ctx = Ctx::new(0);
        let mut event = dance_press(5, 3);
        let result = engine.on_key_event(&mut event, &mut ctx.get());
        assert_eq!(result, EventResult::Continue);
        assert!(engine.handler().0.is_empty());
    }

    #[test]
    fn table_picks_entry_by_count_and_clamps() {
        let table = TableDance::new()
            .key(&[Key::kbd(Keyboard::A), Key::kbd(Keyboard::B)])
            .key(&[Key::kbd(Keyboard::C)]);

        assert_eq!(table.max_taps(0), 2);
        assert_eq!(table.max_taps(1), 1);
        assert!(table.configured(1));
        assert!(!table.configured(2));
    }
}
