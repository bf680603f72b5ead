//! Threshold rules that turn raw readings into actuator intent and advice.
//!
//! Everything here is a pure function of [`FarmState`]: evaluating twice on an
//! unchanged record yields the same result. Thresholds are illustrative, not
//! calibrated agronomy.

use crate::state::FarmState;

/// Soil below this humidity (%) is considered dry.
pub const DRY_BELOW: i32 = 40;
/// Never irrigate when the forecast rain probability (%) reaches this.
pub const RAIN_PROB_LIMIT: f64 = 60.0;
/// km/h
pub const STRONG_WIND_ABOVE: f64 = 40.0;
/// °C
pub const HOT_ABOVE: f64 = 35.0;
/// °C
pub const COLD_BELOW: f64 = 10.0;

pub const PUMP_ADVICE_RAINING: &str = "المطر يهطل. توقف.";
pub const PUMP_ADVICE_DRY: &str = "التربة جافة. سقي.";
pub const PUMP_ADVICE_SUFFICIENT: &str = "رطوبة كافية.";

// ---------------------------------------------------------------------------
// Protection hazards
// ---------------------------------------------------------------------------

/// The single hazard that drives the protection advice. Variants are listed
/// in priority order; the first one that applies wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    HeavyRain,
    StrongWind,
    HighTemperature,
    LowTemperature,
    None,
}

impl Hazard {
    pub fn assess(s: &FarmState) -> Self {
        if s.realtime {
            Self::HeavyRain
        } else if s.wind > STRONG_WIND_ABOVE {
            Self::StrongWind
        } else if s.temperature > HOT_ABOVE {
            Self::HighTemperature
        } else if s.temperature < COLD_BELOW {
            Self::LowTemperature
        } else {
            Self::None
        }
    }

    pub fn advice(self) -> &'static str {
        match self {
            Self::HeavyRain => "غطي الطماطم بالأغطية وتفقدي المصارف.",
            Self::StrongWind => "قوي دعامات الطماطم واحمِي الشتلات الصغيرة.",
            Self::HighTemperature => "اسقي في المساء.",
            Self::LowTemperature => "احمي الطماطم من البرد.",
            Self::None => "الأحوال مستقرة.",
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advisory {
    pub pump_on: bool,
    pub pump_advice: &'static str,
    pub hazard: Hazard,
}

impl Advisory {
    pub fn protection_advice(&self) -> &'static str {
        self.hazard.advice()
    }
}

pub fn evaluate(s: &FarmState) -> Advisory {
    let dry = s.humidity < DRY_BELOW;

    // Active rain overrides dryness; a likely shower postpones irrigation.
    let pump_on = !s.realtime && s.rain_prob < RAIN_PROB_LIMIT && dry;

    let pump_advice = if s.realtime {
        PUMP_ADVICE_RAINING
    } else if dry {
        PUMP_ADVICE_DRY
    } else {
        PUMP_ADVICE_SUFFICIENT
    };

    Advisory {
        pump_on,
        pump_advice,
        hazard: Hazard::assess(s),
    }
}

/// Evaluate and write the result back into the record. The motor always
/// follows the pump. Returns `true` when either advice string changed.
pub fn apply(s: &mut FarmState) -> bool {
    let advisory = evaluate(s);

    s.pump_on = advisory.pump_on;
    s.motor_on = advisory.pump_on;

    let changed = s.pump_advice != advisory.pump_advice
        || s.protection_advice != advisory.protection_advice();
    if changed {
        s.pump_advice = advisory.pump_advice.to_string();
        s.protection_advice = advisory.protection_advice().to_string();
    }
    changed
}

// ===========================================================================
// Tests
// ===========================================================================
