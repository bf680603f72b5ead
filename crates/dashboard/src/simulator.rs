//! Local humidity drift. Every tick nudges humidity toward the direction the
//! pump implies and re-runs the advisory rules, independent of whether the
//! remote authority is reachable.

use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info};

use crate::state::SharedState;
use crate::voice::VoiceQueue;

/// Run the simulator loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(shared: SharedState, period: Duration, advice_narrator: Option<VoiceQueue>) {
    // First tick one full period after start, like a browser interval.
    let mut ticker = interval_at(Instant::now() + period, period);

    info!(period_sec = period.as_secs(), "humidity simulator started");

    loop {
        ticker.tick().await;
        tick(&shared, advice_narrator.as_ref()).await;
    }
}

/// One simulator step. Returns the new humidity.
pub(crate) async fn tick(shared: &SharedState, advice_narrator: Option<&VoiceQueue>) -> i32 {
    let (humidity, fresh_advice) = {
        let mut st = shared.write().await;
        st.farm.tick_humidity();
        (st.farm.humidity, st.recompute())
    };

    debug!(humidity, "simulator tick");

    if let (Some(voice), Some(text)) = (advice_narrator, fresh_advice) {
        voice.enqueue(text);
    }
    humidity
}

// ===========================================================================
// Tests
// ===========================================================================
