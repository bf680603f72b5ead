use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{Actuator, FarmState};

// ---------------------------------------------------------------------------
// Inbound messages (remote authority -> dashboard)
// ---------------------------------------------------------------------------

/// A message received over the channel, decoded once at the boundary.
/// Anything that does not decode into one of these variants is dropped by
/// the caller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Chat {
        text: String,
    },
    State {
        #[serde(default)]
        state: Option<StateDelta>,
    },
}

impl Inbound {
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Partial update to the farm state. Only the closed set of known fields is
/// read; unknown keys are skipped by serde and a known key carrying a value of
/// the wrong type is dropped on its own without rejecting the rest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    #[serde(default, deserialize_with = "lenient")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub rain: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub soil: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub wind: Option<f64>,
    #[serde(default, deserialize_with = "lenient_percent")]
    pub humidity: Option<i32>,
    #[serde(default, deserialize_with = "lenient")]
    pub rain_prob: Option<f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub forecast: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub realtime: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub pump_on: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub motor_on: Option<bool>,
    #[serde(default, deserialize_with = "lenient")]
    pub pump_advice: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub protection_advice: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Humidity is an integer percentage, but peers happily send `41.6`.
fn lenient_percent<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(value.as_f64().map(|v| v.round() as i32))
}

// ---------------------------------------------------------------------------
// Outbound messages (dashboard -> remote authority)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SetState { payload: ActuatorPayload },
    Chat { text: String },
}

impl Outbound {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetState { .. } => "set_state",
            Self::Chat { .. } => "chat",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motor_on: Option<bool>,
}

impl ActuatorPayload {
    /// Report the settled value of the actuator that was changed. A pump
    /// change always carries the motor along with it.
    pub fn after_change(actuator: Actuator, state: &FarmState) -> Self {
        match actuator {
            Actuator::Pump => Self {
                pump_on: Some(state.pump_on),
                motor_on: Some(state.motor_on),
            },
            Actuator::Motor => Self {
                pump_on: None,
                motor_on: Some(state.motor_on),
            },
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
