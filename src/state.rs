//! Endpoint state machine
//!
//! Driver calls (`ep_open`, `urb_submit`, `urb_complete`, `urb_abort`,
//! `ep_close`) run outside every lock. What keeps them apart is the endpoint
//! state: an operation first moves the endpoint into one of the exclusive
//! states (`Preparing`, `Completing`, `AbortingClosing`), calls the driver,
//! and then leaves through one of the non-blocking states.
//!
//! Non-blocking requests are decided immediately from the prior state. A
//! prior state that cannot occur under correct call discipline is an internal
//! consistency failure. Blocking requests are evaluated repeatedly under the
//! endpoint lock until they may proceed.

/// Endpoint lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpState {
    /// Allocated but not opened, or closed
    None,
    /// Open, no transfer queued
    Ready,
    /// A submitter owns the endpoint
    Preparing,
    /// At least one transfer queued
    Queued,
    /// The completion task owns the endpoint
    Completing,
    /// A closer or aborter waits for the current owner to leave
    AbortingClosing,
    /// A closer or aborter owns the endpoint
    AbortCloseCmpl,
}

impl EpState {
    /// True while some operation holds the endpoint exclusively
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            EpState::Preparing
                | EpState::Completing
                | EpState::AbortingClosing
                | EpState::AbortCloseCmpl
        )
    }

    /// State an exclusive owner should leave the endpoint in
    pub fn settled(queued: usize) -> Self {
        if queued == 0 {
            EpState::Ready
        } else {
            EpState::Queued
        }
    }
}

/// Illegal prior state for a requested transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: EpState,
    pub to: EpState,
}

/// Outcome of evaluating a blocking request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eval {
    /// Enter the given state and continue
    Proceed(EpState),
    /// Record the given state, then keep waiting
    Intent(EpState),
    /// Keep waiting without changing anything
    Wait,
}

/// Decide a non-blocking transition (`None`, `Ready`, `Queued`,
/// `AbortCloseCmpl`).
pub fn on_enter(from: EpState, to: EpState) -> Result<EpState, IllegalTransition> {
    use EpState::*;

    let next = match (to, from) {
        // The exclusive owner leaves while a closer waits: hand over.
        (Ready | Queued, AbortingClosing) => AbortCloseCmpl,
        (Ready, None | Preparing | Completing | AbortCloseCmpl) => Ready,
        (Queued, Preparing | Completing) => Queued,
        (AbortCloseCmpl, AbortingClosing) => AbortCloseCmpl,
        (None, AbortCloseCmpl) => None,
        _ => return Err(IllegalTransition { from, to }),
    };
    Ok(next)
}

/// Evaluate a blocking transition (`Preparing`, `Completing`,
/// `AbortingClosing`).
///
/// `intent_recorded` is true once this requester has already published
/// `AbortingClosing`. `saturated` is true when the queue cannot take another
/// transfer.
pub fn on_eval(
    from: EpState,
    to: EpState,
    saturated: bool,
    intent_recorded: bool,
) -> Result<Eval, IllegalTransition> {
    use EpState::*;

    let eval = match (to, from) {
        (Preparing, Ready | Queued) if !saturated => Eval::Proceed(Preparing),
        (Preparing, Ready | Queued | Preparing | Completing) => Eval::Wait,

        (Completing, Queued | Ready) => Eval::Proceed(Completing),
        (Completing, Preparing | Completing | AbortingClosing | AbortCloseCmpl) => Eval::Wait,

        // Our own intent was consumed by the leaving owner.
        (AbortingClosing, AbortCloseCmpl) if intent_recorded => Eval::Proceed(AbortCloseCmpl),
        (AbortingClosing, AbortingClosing) if intent_recorded => Eval::Wait,
        (AbortingClosing, Ready | Queued) => Eval::Proceed(AbortCloseCmpl),
        (AbortingClosing, Preparing | Completing) => Eval::Intent(AbortingClosing),
        // Another closer holds the endpoint.
        (AbortingClosing, AbortingClosing | AbortCloseCmpl) => Eval::Wait,

        _ => return Err(IllegalTransition { from, to }),
    };
    Ok(eval)
}
