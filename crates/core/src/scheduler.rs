//! Macro scheduler.
//!
//! One thread plays back every active macro run. Runs are keyed by the button
//! that triggered them (at most one run per button) and advance through a
//! min-heap of due times. The thread sleeps in `recv_deadline` until either a
//! command arrives or the earliest step is due, so it never waits on device
//! I/O.
//!
//! Cancelling a run removes it from the run table and releases whatever keys
//! it still holds. Its heap entry stays behind and is discarded when popped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bus::{BusEvent, EventBus};
use crate::buttons::ButtonId;
use crate::error::{Error, Result};
use crate::keys::KeyCode;
use crate::macros::{KeyDirection, Macro, PlaybackMode};
use crate::sink::InputSink;

/// Shortest gap between two passes of a looping macro.
const MIN_LOOP_GAP: Duration = Duration::from_millis(1);

const ACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Trigger button released (hold-to-repeat).
    Released,
    /// Same button triggered another macro.
    Restarted,
    /// Toggle macro triggered a second time.
    Toggled,
    /// Explicit cancel (recording start, control plane).
    Requested,
    DeviceLost,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MacroEventKind {
    Started,
    Completed,
    Cancelled { reason: CancelReason },
}

/// Macro run lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroEvent {
    pub run: RunId,
    pub button: ButtonId,
    pub macro_id: String,
    #[serde(flatten)]
    pub kind: MacroEventKind,
}

enum Cmd {
    Trigger {
        button: ButtonId,
        macro_: Arc<Macro>,
    },
    Cancel {
        button: ButtonId,
        reason: CancelReason,
    },
    CancelMacro {
        macro_id: String,
        reason: CancelReason,
        ack: Sender<usize>,
    },
    CancelAll {
        reason: CancelReason,
        ack: Sender<()>,
    },
    Active(Sender<Vec<(ButtonId, String)>>),
    Shutdown,
}

/// Producer side of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Cmd>,
}

impl SchedulerHandle {
    /// Start `macro_` for `button`, replacing any run on that button.
    pub fn trigger(&self, button: ButtonId, macro_: Arc<Macro>) -> Result<()> {
        self.send(Cmd::Trigger { button, macro_ })
    }

    /// Cancel the run on `button`, if any.
    pub fn cancel(&self, button: ButtonId, reason: CancelReason) -> Result<()> {
        self.send(Cmd::Cancel { button, reason })
    }

    /// Cancel every run playing `macro_id`, whatever button it is on.
    /// Returns how many runs were stopped.
    pub fn cancel_macro(&self, macro_id: &str, reason: CancelReason) -> Result<usize> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(Cmd::CancelMacro {
            macro_id: macro_id.to_string(),
            reason,
            ack: ack_tx,
        })?;
        ack_rx.recv_timeout(ACK_TIMEOUT).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout("macro cancel".into()),
            RecvTimeoutError::Disconnected => Error::EngineStopped,
        })
    }

    /// Cancel every run and wait until all their keys are released.
    pub fn cancel_all(&self, reason: CancelReason) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.send(Cmd::CancelAll { reason, ack: ack_tx })?;
        ack_rx.recv_timeout(ACK_TIMEOUT).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout("macro cancel_all".into()),
            RecvTimeoutError::Disconnected => Error::EngineStopped,
        })
    }

    /// Buttons with a live run and the macro each is playing.
    pub fn active(&self) -> Result<Vec<(ButtonId, String)>> {
        let (tx, rx) = channel::bounded(1);
        self.send(Cmd::Active(tx))?;
        rx.recv_timeout(ACK_TIMEOUT)
            .map_err(|_| Error::Timeout("macro query".into()))
    }

    fn send(&self, cmd: Cmd) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::EngineStopped)
    }
}

/// Owner of the scheduler thread.
pub struct MacroScheduler {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

impl MacroScheduler {
    pub fn spawn(sink: Arc<dyn InputSink>, bus: EventBus) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let worker = Worker {
            rx,
            sink,
            bus,
            runs: HashMap::new(),
            by_button: HashMap::new(),
            queue: BinaryHeap::new(),
            next_run: 0,
        };
        let thread = std::thread::Builder::new()
            .name("g13-macros".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            handle: SchedulerHandle { tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Cancel all runs (releasing their keys) and stop the thread.
    pub fn shutdown(&mut self) {
        let _ = self.handle.tx.send(Cmd::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Macro scheduler thread panicked");
            }
        }
    }
}

impl Drop for MacroScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Heap entry. Ordered so `BinaryHeap` pops the earliest due time first.
struct Due {
    at: Instant,
    run: RunId,
}

impl PartialEq for Due {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.run == other.run
    }
}

impl Eq for Due {}

impl PartialOrd for Due {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Due {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: earliest time, then oldest run, on top.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.run.cmp(&self.run))
    }
}

struct MacroRun {
    button: ButtonId,
    macro_: Arc<Macro>,
    cursor: usize,
    pass: u32,
    /// Keys pressed by this run and not yet released, in press order.
    held: Vec<KeyCode>,
}

struct Worker {
    rx: Receiver<Cmd>,
    sink: Arc<dyn InputSink>,
    bus: EventBus,
    runs: HashMap<RunId, MacroRun>,
    by_button: HashMap<ButtonId, RunId>,
    queue: BinaryHeap<Due>,
    next_run: u64,
}

impl Worker {
    fn run(mut self) {
        debug!("Macro scheduler started");
        loop {
            let cmd = match self.queue.peek() {
                Some(due) => self.rx.recv_deadline(due.at),
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match cmd {
                Ok(Cmd::Trigger { button, macro_ }) => self.trigger(button, macro_),
                Ok(Cmd::Cancel { button, reason }) => {
                    if let Some(id) = self.by_button.get(&button).copied() {
                        self.cancel_run(id, reason);
                    }
                }
                Ok(Cmd::CancelMacro {
                    macro_id,
                    reason,
                    ack,
                }) => {
                    let mut ids: Vec<RunId> = self
                        .runs
                        .iter()
                        .filter(|(_, r)| r.macro_.id == macro_id)
                        .map(|(id, _)| *id)
                        .collect();
                    ids.sort();
                    for id in &ids {
                        self.cancel_run(*id, reason);
                    }
                    let _ = ack.send(ids.len());
                }
                Ok(Cmd::CancelAll { reason, ack }) => {
                    self.cancel_everything(reason);
                    let _ = ack.send(());
                }
                Ok(Cmd::Active(reply)) => {
                    let mut active: Vec<(ButtonId, String)> = self
                        .runs
                        .values()
                        .map(|r| (r.button, r.macro_.id.clone()))
                        .collect();
                    active.sort();
                    let _ = reply.send(active);
                }
                Ok(Cmd::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    self.cancel_everything(CancelReason::Shutdown);
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.fire_due(Instant::now());
        }
        debug!("Macro scheduler stopped");
    }

    fn trigger(&mut self, button: ButtonId, macro_: Arc<Macro>) {
        if let Some(old) = self.by_button.get(&button).copied() {
            let same_toggle = self.runs.get(&old).is_some_and(|r| {
                r.macro_.id == macro_.id && r.macro_.playback == PlaybackMode::Toggle
            });
            if same_toggle {
                self.cancel_run(old, CancelReason::Toggled);
                return;
            }
            self.cancel_run(old, CancelReason::Restarted);
        }

        let id = RunId(self.next_run);
        self.next_run += 1;
        debug!(run = id.0, %button, macro_id = %macro_.id, "Macro run started");
        self.publish(id, button, &macro_.id, MacroEventKind::Started);

        let Some(first) = macro_.steps.first() else {
            self.publish(id, button, &macro_.id, MacroEventKind::Completed);
            return;
        };
        let at = Instant::now() + macro_.scaled(first.delay_ms);
        self.runs.insert(
            id,
            MacroRun {
                button,
                macro_,
                cursor: 0,
                pass: 1,
                held: Vec::new(),
            },
        );
        self.by_button.insert(button, id);
        self.queue.push(Due { at, run: id });
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(due) = self.queue.peek() {
            if due.at > now {
                break;
            }
            let Some(due) = self.queue.pop() else { break };
            // Entries of cancelled runs are skipped here.
            let Some(run) = self.runs.get_mut(&due.run) else {
                continue;
            };

            let step = run.macro_.steps[run.cursor];
            match step.direction {
                KeyDirection::Press => {
                    if let Err(e) = self.sink.press(step.key) {
                        warn!(run = due.run.0, key = %step.key, error = %e, "Macro key press failed");
                    }
                    if !run.held.contains(&step.key) {
                        run.held.push(step.key);
                    }
                }
                KeyDirection::Release => {
                    if let Err(e) = self.sink.release(step.key) {
                        warn!(run = due.run.0, key = %step.key, error = %e, "Macro key release failed");
                    }
                    run.held.retain(|k| *k != step.key);
                }
            }
            trace!(run = due.run.0, cursor = run.cursor, key = %step.key, "Macro step");
            run.cursor += 1;

            let m = Arc::clone(&run.macro_);
            if run.cursor < m.steps.len() {
                let at = due.at + m.scaled(m.steps[run.cursor].delay_ms);
                self.queue.push(Due { at, run: due.run });
                continue;
            }

            let another_pass = match m.playback {
                PlaybackMode::Once => false,
                PlaybackMode::Repeat => run.pass < m.repeat_count,
                PlaybackMode::HoldToRepeat | PlaybackMode::Toggle => true,
            };
            if another_pass {
                run.pass += 1;
                run.cursor = 0;
                let gap = m.scaled(m.repeat_delay_ms).max(MIN_LOOP_GAP);
                let at = due.at + gap + m.scaled(m.steps[0].delay_ms);
                self.queue.push(Due { at, run: due.run });
            } else {
                self.retire(due.run, MacroEventKind::Completed);
            }
        }
    }

    fn cancel_run(&mut self, id: RunId, reason: CancelReason) {
        self.retire(id, MacroEventKind::Cancelled { reason });
    }

    fn cancel_everything(&mut self, reason: CancelReason) {
        let mut ids: Vec<RunId> = self.runs.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.cancel_run(id, reason);
        }
        self.queue.clear();
    }

    /// Drop a run, release its keys in reverse press order, and announce why.
    fn retire(&mut self, id: RunId, kind: MacroEventKind) {
        let Some(run) = self.runs.remove(&id) else {
            return;
        };
        if self.by_button.get(&run.button) == Some(&id) {
            self.by_button.remove(&run.button);
        }
        for key in run.held.iter().rev() {
            if let Err(e) = self.sink.release(*key) {
                warn!(run = id.0, %key, error = %e, "Failed to release macro key");
            }
        }
        debug!(run = id.0, button = %run.button, ?kind, "Macro run ended");
        self.publish(id, run.button, &run.macro_.id, kind);
    }

    fn publish(&self, run: RunId, button: ButtonId, macro_id: &str, kind: MacroEventKind) {
        self.bus.publish(BusEvent::Macro(MacroEvent {
            run,
            button,
            macro_id: macro_id.to_string(),
            kind,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, Subscription};
    use crate::macros::MacroStep;
    use crate::sink::mock::{KeyEvent, RecordingSink};

    const A: KeyCode = KeyCode(30);
    const B: KeyCode = KeyCode(48);
    const WAIT: Duration = Duration::from_secs(2);

    fn setup() -> (MacroScheduler, Arc<RecordingSink>, Subscription) {
        let sink = Arc::new(RecordingSink::new());
        let bus = EventBus::new(BusConfig {
            history: 0,
            subscriber_capacity: 4096,
        });
        let sub = bus.subscribe();
        let sched = MacroScheduler::spawn(sink.clone(), bus).unwrap();
        (sched, sink, sub)
    }

    fn tap(key: KeyCode, gap_ms: u64) -> Vec<MacroStep> {
        vec![MacroStep::press(key, 0), MacroStep::release(key, gap_ms)]
    }

    fn macro_events(sub: &mut Subscription) -> Vec<MacroEvent> {
        let mut out = Vec::new();
        while let Some(e) = sub.try_recv() {
            if let BusEvent::Macro(m) = e {
                out.push(m);
            }
        }
        out
    }

    fn wait_for_event(sub: &mut Subscription, pred: impl Fn(&MacroEvent) -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(BusEvent::Macro(m)) = sub.recv_timeout(Duration::from_millis(20)) {
                if pred(&m) {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn once_macro_plays_in_order_with_timing() {
        let (sched, sink, mut sub) = setup();
        let mut steps = tap(A, 30);
        steps.extend(tap(B, 30));
        steps[2].delay_ms = 20;
        let start = Instant::now();
        sched
            .handle()
            .trigger(ButtonId::G1, Arc::new(Macro::new("ab", steps)))
            .unwrap();

        assert!(wait_for_event(&mut sub, |e| e.kind == MacroEventKind::Completed));
        assert_eq!(
            sink.events(),
            vec![
                KeyEvent::Press(A),
                KeyEvent::Release(A),
                KeyEvent::Press(B),
                KeyEvent::Release(B)
            ]
        );
        let timed = sink.timed_events();
        assert!(timed[3].1.duration_since(start) >= Duration::from_millis(80));
        assert!(timed[1].1.duration_since(timed[0].1) >= Duration::from_millis(30));
    }

    #[test]
    fn cancel_mid_sequence_releases_held_keys() {
        let (sched, sink, mut sub) = setup();
        let steps = vec![
            MacroStep::press(A, 0),
            MacroStep::press(B, 0),
            MacroStep::release(B, 5_000),
            MacroStep::release(A, 0),
        ];
        let h = sched.handle();
        h.trigger(ButtonId::G3, Arc::new(Macro::new("hold", steps)))
            .unwrap();
        assert!(sink.wait_for(WAIT, |ev| ev.len() >= 2));

        h.cancel(ButtonId::G3, CancelReason::Requested).unwrap();
        assert!(wait_for_event(&mut sub, |e| matches!(
            e.kind,
            MacroEventKind::Cancelled {
                reason: CancelReason::Requested
            }
        )));
        assert!(sink.held_keys().is_empty());
        // Released in reverse press order.
        assert_eq!(
            &sink.events()[2..],
            &[KeyEvent::Release(B), KeyEvent::Release(A)]
        );
        assert!(h.active().unwrap().is_empty());
    }

    #[test]
    fn retrigger_replaces_run_on_same_button() {
        let (sched, sink, mut sub) = setup();
        let h = sched.handle();
        let long = Arc::new(Macro::new(
            "long",
            vec![MacroStep::press(A, 0), MacroStep::release(A, 5_000)],
        ));
        h.trigger(ButtonId::G1, long.clone()).unwrap();
        assert!(sink.wait_for(WAIT, |ev| !ev.is_empty()));
        h.trigger(ButtonId::G1, long).unwrap();
        assert!(sink.wait_for(WAIT, |ev| ev.len() >= 3));

        let events = macro_events(&mut sub);
        assert!(events.iter().any(|e| e.kind
            == MacroEventKind::Cancelled {
                reason: CancelReason::Restarted
            }));
        assert_eq!(h.active().unwrap().len(), 1);
        // First run's A was released before the second run pressed it again.
        assert_eq!(
            sink.events()[..3],
            [KeyEvent::Press(A), KeyEvent::Release(A), KeyEvent::Press(A)]
        );
    }

    #[test]
    fn concurrent_triggers_keep_one_run_per_button() {
        let (sched, sink, mut sub) = setup();
        let m = Arc::new(Macro::new("m", tap(A, 20)));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let h = sched.handle();
                let m = m.clone();
                std::thread::spawn(move || {
                    let button = if i % 2 == 0 { ButtonId::G1 } else { ButtonId::G2 };
                    for _ in 0..25 {
                        h.trigger(button, m.clone()).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let h = sched.handle();
        h.cancel_all(CancelReason::Requested).unwrap();

        // Replay the lifecycle: never two live runs on one button.
        let mut live: HashMap<ButtonId, i32> = HashMap::new();
        for e in macro_events(&mut sub) {
            let n = live.entry(e.button).or_default();
            match e.kind {
                MacroEventKind::Started => *n += 1,
                _ => *n -= 1,
            }
            assert!(*n <= 1, "two live runs on {}", e.button);
            assert!(*n >= 0);
        }
        assert!(live.values().all(|n| *n == 0));
        assert!(sink.held_keys().is_empty());
    }

    #[test]
    fn cancel_macro_only_stops_runs_of_that_macro() {
        let (sched, sink, _sub) = setup();
        let h = sched.handle();
        let slow = |id: &str| {
            Arc::new(Macro::new(
                id,
                vec![MacroStep::press(A, 0), MacroStep::release(A, 5_000)],
            ))
        };
        h.trigger(ButtonId::G1, slow("doomed")).unwrap();
        h.trigger(ButtonId::G2, slow("doomed")).unwrap();
        h.trigger(ButtonId::G3, slow("kept")).unwrap();
        assert!(sink.wait_for(WAIT, |ev| ev.len() >= 3));

        assert_eq!(h.cancel_macro("doomed", CancelReason::Requested).unwrap(), 2);
        assert_eq!(
            h.active().unwrap(),
            vec![(ButtonId::G3, "kept".to_string())]
        );
        // A button re-triggered with another macro is left alone.
        h.trigger(ButtonId::G1, slow("fresh")).unwrap();
        assert_eq!(h.cancel_macro("doomed", CancelReason::Requested).unwrap(), 0);
        assert_eq!(h.active().unwrap().len(), 2);
    }

    #[test]
    fn toggle_macro_stops_on_second_trigger() {
        let (sched, sink, mut sub) = setup();
        let h = sched.handle();
        let m = Arc::new(Macro::new("t", tap(A, 5)).with_playback(PlaybackMode::Toggle));
        h.trigger(ButtonId::G4, m.clone()).unwrap();
        // Let it loop a few times.
        assert!(sink.wait_for(WAIT, |ev| ev.len() >= 6));
        h.trigger(ButtonId::G4, m).unwrap();
        assert!(wait_for_event(&mut sub, |e| e.kind
            == MacroEventKind::Cancelled {
                reason: CancelReason::Toggled
            }));
        assert!(h.active().unwrap().is_empty());
        assert!(sink.held_keys().is_empty());
    }

    #[test]
    fn repeat_plays_requested_passes() {
        let (sched, sink, mut sub) = setup();
        let mut m = Macro::new("r", tap(A, 1)).with_playback(PlaybackMode::Repeat);
        m.repeat_count = 3;
        sched.handle().trigger(ButtonId::G5, Arc::new(m)).unwrap();
        assert!(wait_for_event(&mut sub, |e| e.kind == MacroEventKind::Completed));
        let presses = sink
            .events()
            .iter()
            .filter(|e| **e == KeyEvent::Press(A))
            .count();
        assert_eq!(presses, 3);
    }

    #[test]
    fn completed_run_releases_leftover_keys() {
        let (sched, sink, mut sub) = setup();
        let m = Macro::new("sticky", vec![MacroStep::press(A, 0)]);
        sched.handle().trigger(ButtonId::G6, Arc::new(m)).unwrap();
        assert!(wait_for_event(&mut sub, |e| e.kind == MacroEventKind::Completed));
        assert_eq!(sink.events(), vec![KeyEvent::Press(A), KeyEvent::Release(A)]);
    }

    #[test]
    fn shutdown_cancels_running_macros() {
        let (mut sched, sink, mut sub) = setup();
        let m = Macro::new("hold", vec![MacroStep::press(A, 0), MacroStep::release(A, 5_000)]);
        sched.handle().trigger(ButtonId::G7, Arc::new(m)).unwrap();
        assert!(sink.wait_for(WAIT, |ev| !ev.is_empty()));
        sched.shutdown();
        assert!(sink.held_keys().is_empty());
        assert!(macro_events(&mut sub).iter().any(|e| e.kind
            == MacroEventKind::Cancelled {
                reason: CancelReason::Shutdown
            }));
    }

    #[test]
    fn macro_event_json_is_flat() {
        let e = MacroEvent {
            run: RunId(4),
            button: ButtonId::G2,
            macro_id: "m".into(),
            kind: MacroEventKind::Cancelled {
                reason: CancelReason::DeviceLost,
            },
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["state"], "cancelled");
        assert_eq!(v["reason"], "device_lost");
        assert_eq!(v["button"], "G2");
    }
}
