//! Sequential narration: a FIFO of utterances drained by a single task so
//! that exactly one utterance is being synthesized at any time.
//!
//! ```text
//! Idle ──[enqueue]──▶ Speaking ──[queue empty]──▶ Idle
//!                      │    ▲
//!                      └────┘ (utterance finished, pop next)
//! ```

use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::advisory::{COLD_BELOW, DRY_BELOW, HOT_ABOVE, RAIN_PROB_LIMIT, STRONG_WIND_ABOVE};
use crate::config::SpeechConfig;
use crate::state::FarmState;

/// Humidity (%) above which narration reports the soil as wet.
const HUMID_ABOVE: i32 = 65;

pub const HUMIDITY_LOW: &str = "الرطوبة منخفضة. يجب تشغيل نظام الري.";
pub const HUMIDITY_HIGH: &str = "الرطوبة عالية. لا داعي للري الآن.";
pub const TEMPERATURE_HIGH: &str = "درجة الحرارة مرتفعة. يفضل الري في المساء.";
pub const TEMPERATURE_LOW: &str = "درجة الحرارة منخفضة. احمي المحاصيل من البرد.";
pub const RAIN_ALERT: &str = "تنبيه! تم رصد أمطار. يجب حماية المحاصيل.";
pub const RAIN_WARNING: &str = "احتمال هطول أمطار غداً. استعدي للحماية.";
pub const WIND_STRONG: &str = "الرياح قوية. قومي بتثبيت الدعامات.";
pub const ALL_STABLE: &str = "الأحوال مستقرة. لا توجد تحذيرات.";
pub const NOT_ANALYZED: &str = "لم يتم تحليل البيانات بعد. الرجاء الانتظار.";

// ---------------------------------------------------------------------------
// Diagnostic narration
// ---------------------------------------------------------------------------

/// One message per condition that currently applies, in a fixed order
/// (humidity, temperature, rain, wind). Falls back to a single all-clear.
pub fn analyze(s: &FarmState) -> Vec<&'static str> {
    let mut lines = Vec::new();

    if s.humidity < DRY_BELOW {
        lines.push(HUMIDITY_LOW);
    } else if s.humidity > HUMID_ABOVE {
        lines.push(HUMIDITY_HIGH);
    }

    if s.temperature > HOT_ABOVE {
        lines.push(TEMPERATURE_HIGH);
    } else if s.temperature < COLD_BELOW {
        lines.push(TEMPERATURE_LOW);
    }

    if s.realtime {
        lines.push(RAIN_ALERT);
    } else if s.rain_prob > RAIN_PROB_LIMIT {
        lines.push(RAIN_WARNING);
    }

    if s.wind > STRONG_WIND_ABOVE {
        lines.push(WIND_STRONG);
    }

    if lines.is_empty() {
        lines.push(ALL_STABLE);
    }
    lines
}

// ---------------------------------------------------------------------------
// Speech backends
// ---------------------------------------------------------------------------

/// Something that can say a line out loud. The returned future resolves once
/// the utterance has finished playing.
pub trait Speaker: Send + Sync + 'static {
    fn speak(&self, text: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Runs an external synthesizer (e.g. `espeak-ng -v ar --stdin`) with the
/// utterance on stdin and waits for it to exit. Text never reaches argv, so a
/// leading `-` cannot be taken for an option.
#[derive(Debug, Clone)]
pub struct CommandSpeaker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSpeaker {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    async fn run(&self, text: &str) -> Result<ExitStatus> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to run speech command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(format!("{text}\n").as_bytes())
                .await
                .with_context(|| format!("failed to feed speech command '{}'", self.program))?;
        }

        child
            .wait()
            .await
            .with_context(|| format!("failed to wait for speech command '{}'", self.program))
    }
}

impl Speaker for CommandSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        // Dropping the child on timeout kills it.
        let status = match timeout(self.timeout, self.run(text)).await {
            Ok(status) => status?,
            Err(_) => bail!(
                "speech command '{}' still running after {:?}, killed",
                self.program,
                self.timeout
            ),
        };

        if !status.success() {
            bail!("speech command '{}' exited with {status}", self.program);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum SpeechBackend {
    Command(CommandSpeaker),
    /// Speech unavailable or disabled: every utterance is a no-op.
    Silent,
}

impl SpeechBackend {
    pub fn from_config(cfg: &SpeechConfig) -> Self {
        if cfg.enabled {
            Self::Command(CommandSpeaker::new(
                cfg.command.clone(),
                cfg.args.clone(),
                Duration::from_secs(cfg.timeout_sec),
            ))
        } else {
            Self::Silent
        }
    }
}

impl Speaker for SpeechBackend {
    async fn speak(&self, text: &str) -> Result<()> {
        match self {
            Self::Command(cmd) => cmd.speak(text).await,
            Self::Silent => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct VoiceQueue<S = SpeechBackend> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for VoiceQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    speaker: S,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<String>,
    speaking: bool,
}

impl<S: Speaker> VoiceQueue<S> {
    pub fn new(speaker: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                speaker,
                pending: Mutex::new(Pending::default()),
            }),
        }
    }

    /// Append `text` to the queue, starting the drain task if nothing is
    /// playing. Blank text is ignored. Must be called from within a tokio
    /// runtime.
    pub fn enqueue(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        if text.trim().is_empty() {
            return false;
        }

        let start = {
            let mut pending = self.inner.lock();
            pending.queue.push_back(text);
            !std::mem::replace(&mut pending.speaking, true)
        };

        if start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.drain().await });
        }
        true
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().speaking
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl<S: Speaker> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain(&self) {
        loop {
            // Popping and going idle happen under the same lock, so an
            // enqueue racing with the last pop either lands before it (and is
            // drained here) or sees `speaking == false` and starts a new task.
            let next = {
                let mut pending = self.lock();
                match pending.queue.pop_front() {
                    Some(text) => text,
                    None => {
                        pending.speaking = false;
                        return;
                    }
                }
            };

            debug!(text = %next, "narrating");
            if let Err(e) = self.speaker.speak(&next).await {
                warn!("speech unavailable, skipping utterance: {e:#}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Step {
        Start(String),
        End(String),
    }

    /// Records start/end of every utterance and the peak number of
    /// utterances in flight.
    #[derive(Default, Clone)]
    struct RecordingSpeaker {
        steps: Arc<Mutex<Vec<Step>>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Speaker for RecordingSpeaker {
        async fn speak(&self, text: &str) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.steps.lock().unwrap().push(Step::Start(text.to_string()));

            tokio::time::sleep(Duration::from_millis(5)).await;

            self.steps.lock().unwrap().push(Step::End(text.to_string()));
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                bail!("no synthesizer");
            }
            Ok(())
        }
    }

    async fn wait_idle<S: Speaker>(q: &VoiceQueue<S>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while q.is_speaking() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("queue never drained");
    }

    fn texts(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .map(|s| match s {
                Step::Start(t) => format!("+{t}"),
                Step::End(t) => format!("-{t}"),
            })
            .collect()
    }

    // -- Queue ordering -----------------------------------------------------

    #[tokio::test]
    async fn plays_in_fifo_order_without_overlap() {
        let speaker = RecordingSpeaker::default();
        let q = VoiceQueue::new(speaker.clone());

        for t in ["A", "B", "C"] {
            assert!(q.enqueue(t));
        }
        assert!(q.is_speaking());
        wait_idle(&q).await;

        let steps = speaker.steps.lock().unwrap().clone();
        assert_eq!(texts(&steps), ["+A", "-A", "+B", "-B", "+C", "-C"]);
        assert_eq!(speaker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn late_enqueue_waits_its_turn() {
        let speaker = RecordingSpeaker::default();
        let q = VoiceQueue::new(speaker.clone());

        q.enqueue("first");
        tokio::time::sleep(Duration::from_millis(1)).await;
        q.enqueue("second");
        wait_idle(&q).await;

        let steps = speaker.steps.lock().unwrap().clone();
        assert_eq!(texts(&steps), ["+first", "-first", "+second", "-second"]);
        assert_eq!(speaker.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rearms_after_going_idle() {
        let speaker = RecordingSpeaker::default();
        let q = VoiceQueue::new(speaker.clone());

        q.enqueue("one");
        wait_idle(&q).await;
        q.enqueue("two");
        wait_idle(&q).await;

        let steps = speaker.steps.lock().unwrap().clone();
        assert_eq!(texts(&steps), ["+one", "-one", "+two", "-two"]);
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let speaker = RecordingSpeaker::default();
        let q = VoiceQueue::new(speaker.clone());

        assert!(!q.enqueue(""));
        assert!(!q.enqueue("   "));
        assert!(!q.is_speaking());
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn failing_speaker_keeps_draining() {
        let speaker = RecordingSpeaker {
            fail: true,
            ..RecordingSpeaker::default()
        };
        let q = VoiceQueue::new(speaker.clone());

        q.enqueue("x");
        q.enqueue("y");
        wait_idle(&q).await;

        assert_eq!(speaker.steps.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn missing_synthesizer_degrades_to_noop() {
        let q = VoiceQueue::new(SpeechBackend::Command(CommandSpeaker::new(
            "definitely-not-a-speech-binary",
            vec![],
            Duration::from_secs(1),
        )));
        q.enqueue("مرحبا");
        wait_idle(&q).await;
    }

    fn shell(script: &str, timeout: Duration) -> CommandSpeaker {
        CommandSpeaker::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn utterance_goes_to_stdin_not_argv() {
        let speaker = shell(
            r#"[ "$#" -eq 0 ] && read line && [ "$line" = "--rate 999" ]"#,
            Duration::from_secs(5),
        );
        speaker.speak("--rate 999").await.unwrap();
        assert!(speaker.speak("something else").await.is_err());
    }

    #[tokio::test]
    async fn hung_synthesizer_is_killed() {
        let speaker = shell("sleep 10", Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = speaker.speak("مرحبا").await.unwrap_err();
        assert!(format!("{err:#}").contains("still running"), "{err:#}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn hung_synthesizer_does_not_stall_queue() {
        let q = VoiceQueue::new(SpeechBackend::Command(shell(
            "sleep 10",
            Duration::from_millis(100),
        )));
        q.enqueue("a");
        q.enqueue("b");
        wait_idle(&q).await;
        assert_eq!(q.pending(), 0);
    }

    #[tokio::test]
    async fn silent_backend_drains() {
        let q = VoiceQueue::new(SpeechBackend::Silent);
        q.enqueue("a");
        q.enqueue("b");
        wait_idle(&q).await;
        assert_eq!(q.pending(), 0);
    }

    // -- analyze ------------------------------------------------------------

    #[test]
    fn analyze_defaults_are_stable() {
        assert_eq!(analyze(&FarmState::default()), [ALL_STABLE]);
    }

    #[test]
    fn analyze_reports_every_condition_in_order() {
        let s = FarmState {
            humidity: 20,
            temperature: 38.0,
            realtime: true,
            wind: 60.0,
            ..FarmState::default()
        };
        assert_eq!(
            analyze(&s),
            [HUMIDITY_LOW, TEMPERATURE_HIGH, RAIN_ALERT, WIND_STRONG]
        );
    }

    #[test]
    fn analyze_wet_cold_and_forecast_rain() {
        let s = FarmState {
            humidity: 80,
            temperature: 4.0,
            rain_prob: 75.0,
            ..FarmState::default()
        };
        assert_eq!(analyze(&s), [HUMIDITY_HIGH, TEMPERATURE_LOW, RAIN_WARNING]);
    }

    #[test]
    fn analyze_live_rain_suppresses_forecast_warning() {
        let s = FarmState {
            realtime: true,
            rain_prob: 90.0,
            ..FarmState::default()
        };
        assert_eq!(analyze(&s), [RAIN_ALERT]);
    }

    #[test]
    fn analyze_boundaries_are_exclusive() {
        let s = FarmState {
            humidity: 65,
            temperature: 35.0,
            rain_prob: 60.0,
            wind: 40.0,
            ..FarmState::default()
        };
        assert_eq!(analyze(&s), [ALL_STABLE]);
    }
}
