//! The per-cycle hook pipeline.
//!
//! Every key event, scanned or synthesized, flows through the same chain of
//! plugin handlers. A handler may pass an event along, consume it, or abort
//! it; whatever survives the chain gets the default treatment of an
//! ordinary key. Plugins never call back into the dispatcher directly:
//! anything they want done (injecting an event, flushing the report) is
//! staged as a command, and the dispatcher's outer loop drains those
//! commands from a bounded work queue. That keeps stack depth flat no
//! matter how many keys decide to resolve each other in one cycle, while
//! still processing an event's injections, in order, before the event's
//! own default action.
//!
//! The cycle order is fixed: `before_cycle`, one pass per scanned event,
//! `before_report`, report flush, `after_cycle`. Timestamps are sampled
//! once per cycle by the caller and handed to every hook unchanged.

use arraydeque::ArrayDeque;
use arrayvec::ArrayVec;

use crate::log::warn;
use crate::report::Reporter;
use crate::{Key, KeyAddr, KeyEvent};

/// Commands staged by plugins and drained by the dispatcher's outer loop.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Command {
    /// Run an event through the full handler chain, then its default action.
    Event(KeyEvent),
    /// Default action only; the chain has already seen this event.
    Default(KeyEvent),
    /// Send the report built so far to the host.
    Flush,
    /// Empty the in-progress report.
    ReleaseAll,
}

pub(crate) const STAGE_DEPTH: usize = 8;
const WORK_QUEUE_DEPTH: usize = 16;
const DRAIN_BUDGET: usize = 64;

/// What a handler did with an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventResult {
    /// Let later handlers and the default action see the event.
    Continue,
    /// The event is handled; skip later handlers and the default action.
    Consumed,
    /// Drop the event entirely, as if it never happened.
    Abort,
}

/// A participant in the event pipeline.
///
/// All hooks have no-op defaults; a plugin implements the ones it cares
/// about. Hooks run in registration order, every cycle.
pub trait Plugin {
    /// Called once, before the first cycle.
    fn on_setup(&mut self) {}

    fn before_cycle(&mut self, _ctx: &mut EventContext<'_>) {}

    fn on_key_event(
        &mut self,
        _event: &mut KeyEvent,
        _ctx: &mut EventContext<'_>,
    ) -> EventResult {
        EventResult::Continue
    }

    /// Last chance to change the report before it is sent.
    fn before_report(&mut self, _ctx: &mut EventContext<'_>) {}

    /// Runs after the report went out; deferred decisions land here.
    fn after_cycle(&mut self, _ctx: &mut EventContext<'_>) {}
}

/// Handle given to every hook invocation.
///
/// Carries the cycle timestamp and collects staged commands. Commands run
/// after the current handler returns, in staging order.
pub struct EventContext<'a> {
    now: u32,
    staged: &'a mut ArrayVec<Command, STAGE_DEPTH>,
    masked: &'a mut u64,
}

impl<'a> EventContext<'a> {
    pub(crate) fn new(
        now: u32,
        staged: &'a mut ArrayVec<Command, STAGE_DEPTH>,
        masked: &'a mut u64,
    ) -> Self {
        EventContext { now, staged, masked }
    }

    /// Milliseconds since boot, sampled once at the start of this cycle.
    pub fn now(&self) -> u32 {
        self.now
    }

    /// Feed a synthesized event back into the pipeline. It re-enters the
    /// full handler chain, marked as injected.
    pub fn inject(&mut self, mut event: KeyEvent) {
        event.state.injected = true;
        self.stage(Command::Event(event));
    }

    /// Send the report built so far, ahead of the end-of-cycle send.
    pub fn flush(&mut self) {
        self.stage(Command::Flush);
    }

    /// Empty the in-progress report.
    pub fn release_all(&mut self) {
        self.stage(Command::ReleaseAll);
    }

    /// Suppress further events from this address for the rest of the
    /// cycle. The mask expires at the next cycle start, or earlier when
    /// the key's own release is seen.
    pub fn mask(&mut self, addr: KeyAddr) {
        *self.masked |= 1 << addr.index();
    }

    fn stage(&mut self, command: Command) {
        if self.staged.try_push(command).is_err() {
            warn!("event pipeline: staged command dropped");
        }
    }
}

/// Runs the plugin chain and the trampoline work queue.
pub struct Dispatcher {
    queue: ArrayDeque<Command, WORK_QUEUE_DEPTH>,
    masked: u64,
    now: u32,
}

enum Phase {
    BeforeCycle,
    BeforeReport,
    AfterCycle,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            queue: ArrayDeque::new(),
            masked: 0,
            now: 0,
        }
    }

    /// Run every plugin's setup hook, in registration order.
    pub fn setup(&mut self, plugins: &mut [&mut dyn Plugin]) {
        for plugin in plugins.iter_mut() {
            plugin.on_setup();
        }
    }

    /// One full scan cycle: hooks, the cycle's scanned events, the report.
    ///
    /// `now` must be sampled once by the caller; every comparison within
    /// the cycle sees the same timestamp. The report is flushed after
    /// `before_report` and then emptied, so held keys are expected to be
    /// re-pressed by next cycle's held events.
    pub fn cycle(
        &mut self,
        now: u32,
        scanned: &[KeyEvent],
        plugins: &mut [&mut dyn Plugin],
        report: &mut dyn Reporter,
    ) {
        self.now = now;
        self.masked = 0;

        self.run_hooks(Phase::BeforeCycle, plugins, report);
        for event in scanned {
            self.dispatch(*event, plugins, report);
        }
        self.run_hooks(Phase::BeforeReport, plugins, report);

        report.flush();
        report.release_all();

        self.run_hooks(Phase::AfterCycle, plugins, report);
    }

    /// Whether an address is currently masked.
    pub fn is_masked(&self, addr: KeyAddr) -> bool {
        self.masked & (1 << addr.index()) != 0
    }

    fn dispatch(
        &mut self,
        event: KeyEvent,
        plugins: &mut [&mut dyn Plugin],
        report: &mut dyn Reporter,
    ) {
        // Masked keys stay invisible until released; the release clears
        // the mask but is itself swallowed.
        if self.is_masked(event.addr) {
            if event.state.toggled_off() {
                self.masked &= !(1 << event.addr.index());
            }
            return;
        }
        self.push_back(Command::Event(event));
        self.run_queue(plugins, report);
    }

    fn run_hooks(
        &mut self,
        phase: Phase,
        plugins: &mut [&mut dyn Plugin],
        report: &mut dyn Reporter,
    ) {
        for i in 0..plugins.len() {
            let mut staged: ArrayVec<Command, STAGE_DEPTH> = ArrayVec::new();
            {
                let mut ctx = EventContext::new(self.now, &mut staged, &mut self.masked);
                match phase {
                    Phase::BeforeCycle => plugins[i].before_cycle(&mut ctx),
                    Phase::BeforeReport => plugins[i].before_report(&mut ctx),
                    Phase::AfterCycle => plugins[i].after_cycle(&mut ctx),
                }
            }
            for command in staged.drain(..) {
                self.push_back(command);
            }
            self.run_queue(plugins, report);
        }
    }

    /// Drain the work queue. Event commands run the handler chain, then
    /// splice their staged commands and their own deferred default action
    /// onto the front of the queue: an event's injections complete, in
    /// injection order, before the event's default action, and all of it
    /// before anything that was already queued behind the event.
    fn run_queue(&mut self, plugins: &mut [&mut dyn Plugin], report: &mut dyn Reporter) {
        let mut budget = DRAIN_BUDGET;
        while let Some(command) = self.queue.pop_front() {
            if budget == 0 {
                warn!("event pipeline: drain budget exhausted, dropping backlog");
                self.queue.clear();
                return;
            }
            budget -= 1;

            match command {
                Command::Event(mut event) => {
                    let mut staged: ArrayVec<Command, STAGE_DEPTH> = ArrayVec::new();
                    let mut result = EventResult::Continue;
                    for i in 0..plugins.len() {
                        let mut ctx =
                            EventContext::new(self.now, &mut staged, &mut self.masked);
                        result = plugins[i].on_key_event(&mut event, &mut ctx);
                        if result != EventResult::Continue {
                            break;
                        }
                    }
                    if result == EventResult::Continue {
                        self.push_front(Command::Default(event));
                    }
                    for command in staged.drain(..).rev() {
                        self.push_front(command);
                    }
                }
                Command::Default(event) => default_action(&event, report),
                Command::Flush => report.flush(),
                Command::ReleaseAll => report.release_all(),
            }
        }
    }

    fn push_back(&mut self, command: Command) {
        if self.queue.push_back(command).is_err() {
            warn!("event pipeline: work queue full, command dropped");
        }
    }

    fn push_front(&mut self, command: Command) {
        if self.queue.push_front(command).is_err() {
            warn!("event pipeline: work queue full, command dropped");
        }
    }
}

/// What happens to an event nobody claimed.
///
/// Presses (fresh or held) land in the report being built. Physical
/// releases need no action in the rebuilt-report model; only injected
/// releases remove a key explicitly.
fn default_action(event: &KeyEvent, report: &mut dyn Reporter) {
    if let Key::Kbd { code, mods } = event.key {
        if event.state.is_pressed {
            report.press(code, mods);
        } else if event.state.toggled_off() && event.state.injected {
            report.release(code, mods);
        }
    }
}
