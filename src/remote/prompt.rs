//! System-instruction builder for the tutoring session.
//!
//! The instruction sent when a session opens is composed of three parts, in
//! order:
//!
//! 1. A fixed persona preamble (Mandarin tutor, tool-use rules).
//! 2. A speaking-rate clause chosen from the requested rate:
//!
//! | Rate              | Clause                          |
//! |-------------------|---------------------------------|
//! | `rate <= 0.8`     | speak slowly, articulate        |
//! | `0.8 < rate < 1.0`| slightly slower than native     |
//! | `rate == 1.0`     | *(none)*                        |
//! | `rate > 1.0`      | fast, fluent native pace        |
//!
//! 3. The caller's scenario instruction, or a free-conversation default.

// ---------------------------------------------------------------------------
// Instruction text
// ---------------------------------------------------------------------------

const PERSONA_PREAMBLE: &str = "\
You are a warm, patient Mandarin Chinese tutor holding a spoken conversation \
with an English-speaking learner.

Rules:
1. Speak mostly in Mandarin, using short sentences suited to the learner's level.
2. After every reply, call update_subtitles with the hanzi, pinyin (with tone \
marks) and an English translation of exactly what you just said.
3. Whenever the learner speaks Chinese, call provide_pronunciation_feedback \
with what they said, its pinyin, a score from 0 to 100 and one short tip.
4. If the learner is stuck, offer a hint in English, then return to Mandarin.";

const RATE_SLOW: &str =
    "Speak slowly and articulate every syllable clearly, pausing between phrases.";

const RATE_SLIGHTLY_SLOW: &str = "Speak slightly slower than a native speaker would.";

const RATE_FAST: &str = "Speak at a fast, fluent, natural native pace.";

const DEFAULT_SCENARIO: &str = "\
Scenario: free conversation. Greet the learner, ask what they would like to \
talk about, and keep a relaxed everyday conversation going.";

// ---------------------------------------------------------------------------
// InstructionBuilder
// ---------------------------------------------------------------------------

/// Builds the system instruction for one session.
///
/// # Example
/// ```rust
/// use live_tutor::remote::InstructionBuilder;
///
/// let text = InstructionBuilder::new(0.7).build();
/// assert!(text.contains("Speak slowly"));
/// assert!(text.contains("free conversation"));
/// ```
#[derive(Debug, Clone)]
pub struct InstructionBuilder {
    speaking_rate: f32,
    scenario: Option<String>,
}

impl InstructionBuilder {
    pub fn new(speaking_rate: f32) -> Self {
        Self {
            speaking_rate,
            scenario: None,
        }
    }

    /// Replace the free-conversation default. Blank scenarios are ignored.
    pub fn scenario(mut self, scenario: Option<&str>) -> Self {
        self.scenario = scenario
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        self
    }

    pub fn build(&self) -> String {
        let mut text = String::with_capacity(1024);
        text.push_str(PERSONA_PREAMBLE);
        if let Some(clause) = rate_clause(self.speaking_rate) {
            text.push_str("\n\n");
            text.push_str(clause);
        }
        text.push_str("\n\n");
        text.push_str(self.scenario.as_deref().unwrap_or(DEFAULT_SCENARIO));
        text
    }
}

/// Speaking-rate clause for `rate`, or `None` at exactly normal speed.
pub fn rate_clause(rate: f32) -> Option<&'static str> {
    if rate <= 0.8 {
        Some(RATE_SLOW)
    } else if rate < 1.0 {
        Some(RATE_SLIGHTLY_SLOW)
    } else if rate > 1.0 {
        Some(RATE_FAST)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
