//! VRRP state machine implementation.
//!
//! Implements RFC 3768 state transitions:
//! - Init → Backup/Master
//! - Backup → Master (on master_down_timer expiry)
//! - Master → Backup (on higher priority advertisement)
//!
//! The machine is a pure function of the instance's current view and one
//! event. It performs no I/O; the dispatcher executes the returned actions.

use crate::timer::TimerClass;
use crate::types::{OWNER_PRIORITY, RESIGN_PRIORITY, VrrpState};
use std::net::Ipv4Addr;

/// What the machine needs to know about an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmContext {
    pub state: VrrpState,
    pub priority: u8,
    pub preempt: bool,
    /// Primary address of the owning interface, used to break priority ties
    pub bound_address: Option<Ipv4Addr>,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    /// Interface became usable for this instance
    Startup,
    /// A validated advertisement for this instance arrived
    AdvertReceived { priority: u8, source: Ipv4Addr },
    MasterDownExpired,
    AdvertTimerExpired,
    /// Priority or advertisement interval changed
    TimingChanged,
    /// Interface down, delete or process shutdown
    Shutdown,
}

/// Delay a timer is armed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDelay {
    AdvertInterval,
    MasterDownInterval,
    SkewTime,
}

/// Side effects requested by a transition, executed in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Send an advertisement at the configured priority
    SendAdvertisement,
    /// Send a priority zero advertisement
    SendResignation,
    StartTimer(TimerClass, TimerDelay),
    CancelTimer(TimerClass),
    ReleaseBinding,
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: VrrpState,
    pub actions: Vec<Action>,
}

impl Transition {
    fn stay(state: VrrpState) -> Self {
        Self {
            state,
            actions: Vec::new(),
        }
    }

    fn to(state: VrrpState, actions: Vec<Action>) -> Self {
        Self { state, actions }
    }
}

fn become_master() -> Transition {
    Transition::to(
        VrrpState::Master,
        vec![
            Action::CancelTimer(TimerClass::MasterDown),
            Action::SendAdvertisement,
            Action::StartTimer(TimerClass::Advertisement, TimerDelay::AdvertInterval),
        ],
    )
}

fn become_backup() -> Transition {
    Transition::to(
        VrrpState::Backup,
        vec![
            Action::CancelTimer(TimerClass::Advertisement),
            Action::StartTimer(TimerClass::MasterDown, TimerDelay::MasterDownInterval),
        ],
    )
}

/// Advance the state machine by one event
pub fn step(ctx: &FsmContext, event: FsmEvent) -> Transition {
    if event == FsmEvent::Shutdown {
        return shutdown(ctx);
    }

    match ctx.state {
        VrrpState::Init => match event {
            FsmEvent::Startup if ctx.priority == OWNER_PRIORITY => become_master(),
            FsmEvent::Startup => become_backup(),
            // Nothing runs until the instance is started
            _ => Transition::stay(VrrpState::Init),
        },
        VrrpState::Backup => backup(ctx, event),
        VrrpState::Master => master(ctx, event),
    }
}

fn backup(ctx: &FsmContext, event: FsmEvent) -> Transition {
    match event {
        FsmEvent::AdvertReceived { priority, .. } if priority == RESIGN_PRIORITY => {
            // Master resigned, take over after the skew time only
            Transition::to(
                VrrpState::Backup,
                vec![Action::StartTimer(TimerClass::MasterDown, TimerDelay::SkewTime)],
            )
        }
        FsmEvent::AdvertReceived { priority, .. } => {
            if priority >= ctx.priority || priority == OWNER_PRIORITY || !ctx.preempt {
                Transition::to(
                    VrrpState::Backup,
                    vec![Action::StartTimer(
                        TimerClass::MasterDown,
                        TimerDelay::MasterDownInterval,
                    )],
                )
            } else {
                // Lower priority master while preempting: let the master-down timer run out
                Transition::stay(VrrpState::Backup)
            }
        }
        FsmEvent::MasterDownExpired => become_master(),
        FsmEvent::TimingChanged => Transition::to(
            VrrpState::Backup,
            vec![Action::StartTimer(
                TimerClass::MasterDown,
                TimerDelay::MasterDownInterval,
            )],
        ),
        FsmEvent::Startup | FsmEvent::AdvertTimerExpired | FsmEvent::Shutdown => {
            Transition::stay(VrrpState::Backup)
        }
    }
}

fn master(ctx: &FsmContext, event: FsmEvent) -> Transition {
    match event {
        FsmEvent::AdvertTimerExpired => Transition::to(
            VrrpState::Master,
            vec![
                Action::SendAdvertisement,
                Action::StartTimer(TimerClass::Advertisement, TimerDelay::AdvertInterval),
            ],
        ),
        FsmEvent::AdvertReceived { priority, .. } if priority == RESIGN_PRIORITY => {
            // Another router resigned; reassert immediately
            Transition::to(
                VrrpState::Master,
                vec![
                    Action::SendAdvertisement,
                    Action::StartTimer(TimerClass::Advertisement, TimerDelay::AdvertInterval),
                ],
            )
        }
        FsmEvent::AdvertReceived { priority, source } => {
            let yields = priority > ctx.priority
                || (priority == ctx.priority
                    && ctx.bound_address.is_none_or(|own| source > own));
            if yields {
                become_backup()
            } else {
                // Our next advertisement reasserts mastership
                Transition::stay(VrrpState::Master)
            }
        }
        FsmEvent::TimingChanged => Transition::to(
            VrrpState::Master,
            vec![Action::StartTimer(
                TimerClass::Advertisement,
                TimerDelay::AdvertInterval,
            )],
        ),
        FsmEvent::Startup | FsmEvent::MasterDownExpired | FsmEvent::Shutdown => {
            Transition::stay(VrrpState::Master)
        }
    }
}

fn shutdown(ctx: &FsmContext) -> Transition {
    let mut actions = Vec::with_capacity(4);
    if ctx.state == VrrpState::Master {
        actions.push(Action::SendResignation);
    }
    actions.extend([
        Action::CancelTimer(TimerClass::MasterDown),
        Action::CancelTimer(TimerClass::Advertisement),
        Action::ReleaseBinding,
    ]);
    Transition::to(VrrpState::Init, actions)
}
