//! The `add-numbers` RPC, with optional fault injection for exercising
//! callers' reject and timeout handling.

use rand::Rng;
use serde_json::{Value, json};

/// What the provider does with one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Send(Value),
    Reject,
    Error(String),
    /// Never answer; the caller will time out.
    Silence,
}

/// Sum of the first two numbers in `payload`.
pub fn add_numbers(payload: &Value) -> Result<f64, String> {
    let numbers: Vec<f64> = payload
        .as_array()
        .ok_or_else(|| "expected an array of numbers".to_string())?
        .iter()
        .map(|v| v.as_f64().ok_or_else(|| format!("not a number: {}", v)))
        .collect::<Result<_, _>>()?;
    if numbers.len() < 2 {
        return Err(format!("expected at least two numbers, got {}", numbers.len()));
    }
    Ok(numbers[0] + numbers[1])
}

/// Randomly rejects or drops requests. Both probabilities default to zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInjector {
    reject_probability: f64,
    silence_probability: f64,
}

impl FaultInjector {
    pub fn new(reject_probability: f64, silence_probability: f64) -> Self {
        Self {
            reject_probability: reject_probability.clamp(0.0, 1.0),
            silence_probability: silence_probability.clamp(0.0, 1.0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.reject_probability > 0.0 || self.silence_probability > 0.0
    }

    /// Decides the outcome from a roll in `0.0..1.0`.
    pub fn decide(&self, roll: f64, payload: &Value) -> Outcome {
        if roll < self.reject_probability {
            return Outcome::Reject;
        }
        if roll < self.reject_probability + self.silence_probability {
            return Outcome::Silence;
        }
        match add_numbers(payload) {
            Ok(sum) => Outcome::Send(number(sum)),
            Err(e) => Outcome::Error(e),
        }
    }

    pub fn handle(&self, payload: &Value) -> Outcome {
        let roll = if self.is_active() { rand::rng().random::<f64>() } else { 1.0 };
        self.decide(roll, payload)
    }
}

// Whole sums go out as integers so `[2, 3]` answers `5`, not `5.0`.
fn number(sum: f64) -> Value {
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        json!(sum as i64)
    } else {
        json!(sum)
    }
}
