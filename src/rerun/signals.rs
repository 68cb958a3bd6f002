//! Auxiliary quality signals.
//!
//! Signals arrive from outside the loop as loosely-shaped JSON. Each one is
//! decoded exactly once into [`Decoded`]; anything that does not fit the
//! expected shape becomes `Absent` and is never an error.

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of decoding one signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Present(T),
    Absent,
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Decoded::Absent
    }
}

impl<T> Decoded<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Decoded::Present(_))
    }

    pub fn as_option(&self) -> Option<&T> {
        match self {
            Decoded::Present(value) => Some(value),
            Decoded::Absent => None,
        }
    }
}

/// A signal shape that can be decoded from JSON.
pub trait Signal: DeserializeOwned {
    /// Name used in logs and feedback.
    const NAME: &'static str;

    /// Range checks beyond what deserialization enforces.
    fn is_valid(&self) -> bool {
        true
    }
}

impl<T: Signal> Decoded<T> {
    /// Decode a raw value; missing, mistyped or out-of-range input is `Absent`.
    pub fn decode(raw: Option<&Value>) -> Self {
        let Some(raw) = raw else {
            return Decoded::Absent;
        };
        match serde_json::from_value::<T>(raw.clone()) {
            Ok(signal) if signal.is_valid() => Decoded::Present(signal),
            Ok(_) => {
                debug!("Dropping out-of-range {} signal: {}", T::NAME, raw);
                Decoded::Absent
            }
            Err(e) => {
                debug!("Dropping malformed {} signal: {}", T::NAME, e);
                Decoded::Absent
            }
        }
    }
}

/// Worker fatigue, 0.0 (fresh) to 1.0 (exhausted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatigueSignal {
    pub level: f64,
    #[serde(default)]
    pub note: Option<String>,
}

impl Signal for FatigueSignal {
    const NAME: &'static str = "fatigue";

    fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.level)
    }
}

/// Output echoing the prompt back rather than doing the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasEchoSignal {
    pub detected: bool,
    #[serde(default)]
    pub overlap: Option<f64>,
}

impl Signal for BiasEchoSignal {
    const NAME: &'static str = "bias_echo";

    fn is_valid(&self) -> bool {
        self.overlap.is_none_or(f64::is_finite)
    }
}

/// Safety review outcome; the only signal that can force a rerun.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySignal {
    pub rerun: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Signal for SafetySignal {
    const NAME: &'static str = "safety";
}

/// All auxiliary signals for one decision.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QualitySignals {
    pub fatigue: Decoded<FatigueSignal>,
    pub bias_echo: Decoded<BiasEchoSignal>,
    pub safety: Decoded<SafetySignal>,
}

impl QualitySignals {
    /// No signals at all.
    pub fn none() -> Self {
        Self::default()
    }

    /// Decode from an object keyed by `fatigue`, `bias_echo` (or `bias-echo`)
    /// and `safety`. A non-object yields no signals.
    pub fn from_value(raw: &Value) -> Self {
        let Some(obj) = raw.as_object() else {
            if !raw.is_null() {
                debug!("Ignoring non-object signal bundle: {}", raw);
            }
            return Self::none();
        };
        Self {
            fatigue: Decoded::decode(obj.get("fatigue")),
            bias_echo: Decoded::decode(obj.get("bias_echo").or_else(|| obj.get("bias-echo"))),
            safety: Decoded::decode(obj.get("safety")),
        }
    }

    /// Decode from JSON text; unparseable text yields no signals.
    pub fn from_json_str(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::from_value(&value),
            Err(e) => {
                debug!("Ignoring unparseable signals: {}", e);
                Self::none()
            }
        }
    }
}
