use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::advisory;
use crate::protocol::StateDelta;

/// Maximum number of chat lines and events retained in each ring buffer.
const MAX_ENTRIES: usize = 200;

/// Humidity drifts down toward this floor while the pump is off...
const DRY_FLOOR: i32 = 35;
/// ...and up toward this ceiling while it runs.
const WET_CEILING: i32 = 70;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<Dashboard>>;

// ---------------------------------------------------------------------------
// Farm state record
// ---------------------------------------------------------------------------

/// Snapshot of sensor readings, actuator flags and derived advice. Field
/// names on the wire are camelCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FarmState {
    /// °C
    pub temperature: f64,
    /// Manual rain flag. Kept and displayed, never used for decisions;
    /// `realtime` is the live signal.
    pub rain: bool,
    pub soil: String,
    /// km/h
    pub wind: f64,
    /// Percentage, always within 0..=100.
    pub humidity: i32,
    pub rain_prob: f64,
    pub forecast: String,
    /// Rain currently detected by the live sensor.
    pub realtime: bool,
    pub pump_on: bool,
    pub motor_on: bool,
    pub pump_advice: String,
    pub protection_advice: String,
}

impl Default for FarmState {
    fn default() -> Self {
        Self {
            temperature: 24.0,
            rain: false,
            soil: "جيدة".to_string(),
            wind: 10.0,
            humidity: 65,
            rain_prob: 10.0,
            forecast: "غائم جزئياً".to_string(),
            realtime: false,
            pump_on: false,
            motor_on: false,
            pump_advice: String::new(),
            protection_advice: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actuator {
    Pump,
    Motor,
}

impl FarmState {
    /// Overwrite every field present in `delta`. Fields absent from the delta
    /// keep their value. Advice is not recomputed here.
    pub fn apply_remote_delta(&mut self, delta: &StateDelta) {
        fn merge<T: Clone>(slot: &mut T, incoming: &Option<T>) {
            if let Some(v) = incoming {
                *slot = v.clone();
            }
        }

        merge(&mut self.temperature, &delta.temperature);
        merge(&mut self.rain, &delta.rain);
        merge(&mut self.soil, &delta.soil);
        merge(&mut self.wind, &delta.wind);
        merge(&mut self.humidity, &delta.humidity);
        merge(&mut self.rain_prob, &delta.rain_prob);
        merge(&mut self.forecast, &delta.forecast);
        merge(&mut self.realtime, &delta.realtime);
        merge(&mut self.pump_on, &delta.pump_on);
        merge(&mut self.motor_on, &delta.motor_on);
        merge(&mut self.pump_advice, &delta.pump_advice);
        merge(&mut self.protection_advice, &delta.protection_advice);

        self.clamp_humidity();
    }

    pub fn actuator(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Pump => self.pump_on,
            Actuator::Motor => self.motor_on,
        }
    }

    /// Setting the pump drags the motor along; setting the motor alone leaves
    /// the pump untouched.
    pub fn set_actuator(&mut self, actuator: Actuator, on: bool) {
        match actuator {
            Actuator::Pump => {
                self.pump_on = on;
                self.motor_on = on;
            }
            Actuator::Motor => self.motor_on = on,
        }
    }

    /// One step of simulated drift: dry out while the pump is off, wet up
    /// while it runs.
    pub fn tick_humidity(&mut self) {
        if !self.pump_on && self.humidity > DRY_FLOOR {
            self.humidity -= 1;
        } else if self.pump_on && self.humidity < WET_CEILING {
            self.humidity += 1;
        }
        self.clamp_humidity();
    }

    fn clamp_humidity(&mut self) {
        self.humidity = self.humidity.clamp(0, 100);
    }
}

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

pub struct Dashboard {
    pub started_at: Instant,
    pub farm: FarmState,
    pub channel_connected: bool,
    /// Latest fetched recommendation. Shown instead of the rule-based advice
    /// until the next recomputation.
    pub recommendation: Option<String>,
    pub chat: VecDeque<ChatLine>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatLine {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub direction: ChatDirection,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Channel,
    Error,
    System,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Dashboard {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            farm: FarmState::default(),
            channel_connected: false,
            recommendation: None,
            chat: VecDeque::with_capacity(MAX_ENTRIES),
            events: VecDeque::with_capacity(MAX_ENTRIES),
        }
    }

    pub fn shared() -> SharedState {
        let mut dashboard = Self::new();
        dashboard.recompute();
        Arc::new(RwLock::new(dashboard))
    }

    /// Re-derive actuator intent and both advice strings from the current
    /// readings. Returns the combined advice text when it changed.
    pub fn recompute(&mut self) -> Option<String> {
        self.recommendation = None;
        if advisory::apply(&mut self.farm) {
            Some(self.advice_text())
        } else {
            None
        }
    }

    /// Text shown in the advice panel.
    pub fn advice_text(&self) -> String {
        if let Some(rec) = &self.recommendation {
            return rec.clone();
        }
        if self.farm.pump_advice.is_empty() && self.farm.protection_advice.is_empty() {
            return String::new();
        }
        format!("{}\n{}", self.farm.pump_advice, self.farm.protection_advice)
    }

    pub fn record_chat(&mut self, direction: ChatDirection, text: String) {
        if self.chat.len() >= MAX_ENTRIES {
            self.chat.pop_front();
        }
        self.chat.push_back(ChatLine {
            ts: OffsetDateTime::now_utc(),
            direction,
            text,
        });
    }

    pub fn record_channel(&mut self, detail: String) {
        self.push_event(EventKind::Channel, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_ENTRIES {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
