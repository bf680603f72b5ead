//! Display strings for each field, keyed the same way as on the wire.

use std::collections::BTreeMap;

use crate::state::Dashboard;

pub const ON: &str = "يعمل";
pub const OFF: &str = "متوقف";
pub const CONNECTED: &str = "متصل";
pub const DISCONNECTED: &str = "غير متصل";

/// Connectivity indicator key.
pub const CHANNEL_KEY: &str = "channel";

pub const FIELDS: &[&str] = &[
    "temperature",
    "rain",
    "soil",
    "wind",
    "humidity",
    "rainProb",
    "forecast",
    "realtime",
    "pumpOn",
    "motorOn",
    "pumpAdvice",
    "protectionAdvice",
    CHANNEL_KEY,
];

fn on_off(v: bool) -> String {
    let label = if v { ON } else { OFF };
    label.to_string()
}

/// Formatted value for `key`, or `None` for an unknown key.
pub fn display(key: &str, d: &Dashboard) -> Option<String> {
    let s = &d.farm;
    let text = match key {
        "temperature" => format!("{} °C", s.temperature),
        "wind" => format!("{} كم/س", s.wind),
        "humidity" => format!("{} %", s.humidity),
        "rainProb" => format!("{} %", s.rain_prob),
        "rain" => on_off(s.rain),
        "realtime" => on_off(s.realtime),
        "pumpOn" => on_off(s.pump_on),
        "motorOn" => on_off(s.motor_on),
        "soil" => s.soil.clone(),
        "forecast" => s.forecast.clone(),
        "pumpAdvice" => s.pump_advice.clone(),
        "protectionAdvice" => s.protection_advice.clone(),
        CHANNEL_KEY => {
            let label = if d.channel_connected { CONNECTED } else { DISCONNECTED };
            label.to_string()
        }
        _ => return None,
    };
    Some(text)
}

/// Every field rendered at once.
pub fn view(d: &Dashboard) -> BTreeMap<&'static str, String> {
    FIELDS
        .iter()
        .filter_map(|&k| display(k, d).map(|v| (k, v)))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
