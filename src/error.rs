use std::error;
use std::fmt;

/// Errors surfaced to the control/state-machine caller. Each variant maps to a
/// protocol-level rejection: the USB layer answers all of them with a STALL on
/// the control endpoint.
///
/// Pool exhaustion and an empty buffer queue are deliberately not represented
/// here; both are normal streaming outcomes handled by skip-and-retry.
#[derive(Debug, Clone, PartialEq)]
pub enum UvcError {
    /// A state-machine transition outside the allowed table. No side effect
    /// has taken place.
    State(String),
    /// A PROBE/COMMIT referencing a format or frame index the device does not
    /// expose. In-range-but-unsupported values are clamped instead.
    Negotiation(String),
    /// A malformed control request, or one whose payload exceeds the 60-byte
    /// exchange capacity.
    Protocol(String),
}

impl fmt::Display for UvcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UvcError::State(msg) => write!(f, "state error: {}", msg),
            UvcError::Negotiation(msg) => write!(f, "negotiation error: {}", msg),
            UvcError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl error::Error for UvcError {}
