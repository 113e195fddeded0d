//! Readiness phase machine for the in-guest watcher.
//!
//! ```text
//! awaiting_process → awaiting_window → (awaiting_anti_cheat) → ready
//!                                                                │
//!                                    terminating ← monitoring ←──┘
//! ```
//!
//! The anti-cheat pre-launch window is recognised purely by its fixed
//! pixel size; readiness is withheld until the observed window grows past
//! that size or the owning process disappears (a release, not a failure —
//! some launchers replace the process wholesale).

use statig::prelude::*;
use tracing::info;

/// Exact dimensions of the anti-cheat splash window.
pub const ANTI_CHEAT_SPLASH: (i32, i32) = (320, 240);

/// Dimensions a window must strictly exceed to count as the real
/// application window after an anti-cheat splash was seen.
pub const ANTI_CHEAT_RELEASE: (i32, i32) = (321, 241);

/// Observations dispatched into the machine by the watcher's polling loops.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// The target executable appeared in the process table.
    ProcessRunning,
    /// The target process is gone from the process table.
    ProcessGone,
    /// A window owned by the target process was enumerated.
    Window { width: i32, height: i32 },
    /// The `/ready` call to the client succeeded.
    ReadySignalled,
    /// The target process exited after the session was live.
    TargetExited,
}

/// Shared storage for the readiness machine.
pub struct ReadinessMachine {
    /// Whether the anti-cheat pre-launch window should gate readiness.
    pub wait_for_anti_cheat: bool,
}

#[state_machine(
    initial = "State::awaiting_process()",
    state(derive(Debug, Clone, PartialEq))
)]
impl ReadinessMachine {
    /// Waiting for the target executable to appear in the process table.
    #[state]
    fn awaiting_process(&mut self, event: &WatchEvent) -> Outcome<State> {
        match event {
            WatchEvent::ProcessRunning => {
                info!("target process running");
                Transition(State::awaiting_window())
            }
            _ => Handled,
        }
    }

    /// Process exists; waiting for it to own an enumerable window.
    #[state]
    fn awaiting_window(&mut self, event: &WatchEvent) -> Outcome<State> {
        match event {
            WatchEvent::Window { width, height } => {
                if self.wait_for_anti_cheat
                    && (*width, *height) == ANTI_CHEAT_SPLASH
                {
                    info!("anti-cheat splash detected, waiting it out");
                    Transition(State::awaiting_anti_cheat())
                } else {
                    info!(width, height, "application window found");
                    Transition(State::ready())
                }
            }
            _ => Handled,
        }
    }

    /// The 320x240 anti-cheat splash is up; hold readiness until the real
    /// window replaces it.
    #[state]
    fn awaiting_anti_cheat(&mut self, event: &WatchEvent) -> Outcome<State> {
        match event {
            WatchEvent::Window { width, height }
                if *width > ANTI_CHEAT_RELEASE.0 && *height > ANTI_CHEAT_RELEASE.1 =>
            {
                info!(width, height, "anti-cheat splash released");
                Transition(State::ready())
            }
            // The launcher may kill and respawn the process; treat
            // disappearance as a release and let the ready path re-check.
            WatchEvent::ProcessGone => {
                info!("process gone during anti-cheat wait, releasing");
                Transition(State::ready())
            }
            _ => Handled,
        }
    }

    /// Window is interactive; foreground it and signal the client.
    #[state]
    fn ready(&mut self, event: &WatchEvent) -> Outcome<State> {
        match event {
            WatchEvent::ReadySignalled => Transition(State::monitoring()),
            _ => Handled,
        }
    }

    /// Session live: watching target liveness and pinging keepalive.
    #[state]
    fn monitoring(&mut self, event: &WatchEvent) -> Outcome<State> {
        match event {
            WatchEvent::TargetExited => {
                info!("target process exited");
                Transition(State::terminating())
            }
            _ => Handled,
        }
    }

    /// Terminal: telling the client the session is over.
    #[state]
    fn terminating(&mut self, event: &WatchEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

/// Phase predicates for the polling loops driving the machine. The
/// generated state constructors are not visible outside this module, so
/// callers branch on these instead.
impl State {
    pub fn is_awaiting_window(&self) -> bool {
        matches!(self, State::AwaitingWindow {})
    }

    pub fn is_awaiting_anti_cheat(&self) -> bool {
        matches!(self, State::AwaitingAntiCheat {})
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, State::Ready {})
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(wait_for_anti_cheat: bool) -> StateMachine<ReadinessMachine> {
        ReadinessMachine { wait_for_anti_cheat }.state_machine()
    }

    #[test]
    fn straight_path_without_anti_cheat() {
        let mut sm = machine(false);
        sm.handle(&WatchEvent::ProcessRunning);
        sm.handle(&WatchEvent::Window { width: 320, height: 240 });
        assert_eq!(*sm.state(), State::ready(), "gating disabled: 320x240 is just a window");
    }

    #[test]
    fn anti_cheat_splash_withholds_readiness() {
        let mut sm = machine(true);
        sm.handle(&WatchEvent::ProcessRunning);
        sm.handle(&WatchEvent::Window { width: 320, height: 240 });
        assert_eq!(*sm.state(), State::awaiting_anti_cheat());

        // Still the splash, still not ready.
        sm.handle(&WatchEvent::Window { width: 320, height: 240 });
        assert_eq!(*sm.state(), State::awaiting_anti_cheat());

        // Barely bigger is not enough: both dimensions must strictly exceed
        // the release threshold.
        sm.handle(&WatchEvent::Window { width: 321, height: 241 });
        assert_eq!(*sm.state(), State::awaiting_anti_cheat());

        sm.handle(&WatchEvent::Window { width: 1920, height: 1080 });
        assert_eq!(*sm.state(), State::ready());
    }

    #[test]
    fn process_disappearing_releases_anti_cheat_wait() {
        let mut sm = machine(true);
        sm.handle(&WatchEvent::ProcessRunning);
        sm.handle(&WatchEvent::Window { width: 320, height: 240 });
        sm.handle(&WatchEvent::ProcessGone);
        assert_eq!(*sm.state(), State::ready());
    }

    #[test]
    fn non_splash_window_goes_straight_to_ready() {
        let mut sm = machine(true);
        sm.handle(&WatchEvent::ProcessRunning);
        sm.handle(&WatchEvent::Window { width: 1280, height: 720 });
        assert_eq!(*sm.state(), State::ready());
    }

    #[test]
    fn full_session_lifecycle() {
        let mut sm = machine(false);
        sm.handle(&WatchEvent::ProcessRunning);
        sm.handle(&WatchEvent::Window { width: 800, height: 600 });
        sm.handle(&WatchEvent::ReadySignalled);
        assert_eq!(*sm.state(), State::monitoring());
        sm.handle(&WatchEvent::TargetExited);
        assert_eq!(*sm.state(), State::terminating());
    }

    #[test]
    fn phase_predicates_track_the_transitions() {
        let mut sm = machine(true);
        assert!(!sm.state().is_awaiting_window());
        sm.handle(&WatchEvent::ProcessRunning);
        assert!(sm.state().is_awaiting_window());
        sm.handle(&WatchEvent::Window { width: 320, height: 240 });
        assert!(sm.state().is_awaiting_anti_cheat());
        sm.handle(&WatchEvent::ProcessGone);
        assert!(sm.state().is_ready());
        assert!(!sm.state().is_awaiting_anti_cheat());
    }

    #[test]
    fn window_before_process_is_ignored() {
        let mut sm = machine(false);
        sm.handle(&WatchEvent::Window { width: 800, height: 600 });
        assert_eq!(*sm.state(), State::awaiting_process());
    }
}
