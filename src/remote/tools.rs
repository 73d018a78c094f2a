//! Tool declarations advertised to the remote side at setup.
//!
//! The remote model may invoke these by name; the session manager routes the
//! arguments to the subtitle and pronunciation-feedback events and always
//! acknowledges the call.

use serde_json::{json, Value};

pub const UPDATE_SUBTITLES: &str = "update_subtitles";
pub const PROVIDE_PRONUNCIATION_FEEDBACK: &str = "provide_pronunciation_feedback";

/// `functionDeclarations` entries for both tools.
pub fn declarations() -> Vec<Value> {
    vec![
        json!({
            "name": UPDATE_SUBTITLES,
            "description": "Show subtitles for what the tutor just said.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "hanzi":   { "type": "STRING", "description": "Chinese characters." },
                    "pinyin":  { "type": "STRING", "description": "Pinyin with tone marks." },
                    "english": { "type": "STRING", "description": "English translation." }
                },
                "required": ["hanzi", "pinyin", "english"]
            }
        }),
        json!({
            "name": PROVIDE_PRONUNCIATION_FEEDBACK,
            "description": "Grade the learner's most recent Chinese utterance.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "userText": { "type": "STRING", "description": "What the learner said, in hanzi." },
                    "pinyin":   { "type": "STRING", "description": "Pinyin of what the learner said." },
                    "score":    { "type": "NUMBER", "description": "Pronunciation score from 0 to 100." },
                    "feedback": { "type": "STRING", "description": "One short, actionable tip." }
                },
                "required": ["userText", "pinyin", "score", "feedback"]
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declares_both_tools() {
        let names: Vec<_> = declarations()
            .iter()
            .map(|d| d["name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, vec![UPDATE_SUBTITLES, PROVIDE_PRONUNCIATION_FEEDBACK]);
    }

    #[test]
    fn feedback_requires_score() {
        let decls = declarations();
        let required = decls[1]["parameters"]["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "score"));
    }
}
