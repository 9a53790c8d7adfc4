//! Fault and latency injection.
//!
//! Both random draws happen per dispatch, never when a rule is loaded, so a
//! configured error probability shows up as a long-run frequency.

use crate::config::{DelayMode, ErrorResponse, FaultSpec};
use rand::Rng;

/// Body used when a fault fires on a rule without an `error_response`.
pub const DEFAULT_FAULT_BODY: &str = r#"{"error":"Injected fault"}"#;

/// Outcome of the fault/latency draws for one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FaultDecision {
    /// Substituted response when the fault fired
    pub error: Option<ErrorResponse>,
    /// Delay to hold the response for
    pub delay_ms: u64,
}

impl FaultDecision {
    pub fn fired(&self) -> bool {
        self.error.is_some()
    }
}

/// Decide fault and delay for one dispatch. An absent spec means no fault and
/// no delay.
pub fn decide<R: Rng>(spec: Option<&FaultSpec>, rng: &mut R) -> FaultDecision {
    let Some(spec) = spec else {
        return FaultDecision::default();
    };

    let roll: u8 = rng.gen_range(0..100);
    let error = (roll < spec.error_probability).then(|| {
        spec.error_response.clone().unwrap_or_else(|| ErrorResponse {
            status: 500,
            body: DEFAULT_FAULT_BODY.to_string(),
        })
    });

    FaultDecision {
        error,
        delay_ms: delay_ms(spec, rng),
    }
}

/// Delay for one dispatch. `variable` draws from `[min_ms, max_ms)` and falls
/// back to `min_ms` when the range is empty.
pub fn delay_ms<R: Rng>(spec: &FaultSpec, rng: &mut R) -> u64 {
    match spec.delay {
        DelayMode::None => 0,
        DelayMode::Fixed => spec.fixed_ms,
        DelayMode::Variable => {
            if spec.max_ms > spec.min_ms {
                rng.gen_range(spec.min_ms..spec.max_ms)
            } else {
                spec.min_ms
            }
        }
    }
}
