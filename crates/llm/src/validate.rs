//! Post-generation cleanup and quality gate.

use std::fmt;

use hearth_config::AppConfig;

/// Why a generated response was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    Impersonation,
    Fallback,
    UpstreamError,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::TooShort => "response too short",
            Self::Impersonation => "response speaks as the user",
            Self::Fallback => "generation fell back to the placeholder",
            Self::UpstreamError => "response carries an upstream error",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for Rejection {}

#[derive(Debug, Clone)]
pub struct ResponseValidator {
    agent_name: String,
    user_name: String,
    fallback: String,
}

impl ResponseValidator {
    pub fn new(
        agent_name: impl Into<String>,
        user_name: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            user_name: user_name.into(),
            fallback: fallback.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            &config.agent.name,
            &config.agent.user_name,
            &config.llm.fallback_message,
        )
    }

    /// Strip the speaker tag the model was asked to start with, plus any
    /// punctuation left dangling in front of the dialogue.
    pub fn clean(&self, raw: &str) -> String {
        self.strip_speaker(raw).trim().to_string()
    }

    /// Leading-edge half of [`clean`](Self::clean): trailing text is left
    /// untouched so streamed fragments keep their spacing.
    fn strip_speaker<'a>(&self, raw: &'a str) -> &'a str {
        let agent = &self.agent_name;
        let prefixes = [
            format!("[{agent}]:"),
            format!("[{agent}],"),
            format!("[{agent}]"),
            format!("{agent}:"),
        ];

        let mut text = raw.trim_start();
        for prefix in &prefixes {
            if let Some(rest) = text.strip_prefix(prefix.as_str()) {
                text = rest.trim_start();
            }
        }
        text.trim_start_matches(|c: char| ".:,;- ".contains(c))
    }

    fn speaks_as_user(&self, cleaned: &str) -> bool {
        let user = &self.user_name;
        cleaned.starts_with("[User]:")
            || cleaned.starts_with("User:")
            || cleaned.starts_with(&format!("[{user}]:"))
            || cleaned.starts_with(&format!("{user}:"))
            || cleaned.contains("\n[User]:")
    }

    pub fn validate(&self, cleaned: &str) -> Result<(), Rejection> {
        if cleaned.chars().count() < 2 {
            return Err(Rejection::TooShort);
        }
        if self.speaks_as_user(cleaned) {
            return Err(Rejection::Impersonation);
        }
        if cleaned == self.fallback.trim() {
            return Err(Rejection::Fallback);
        }
        if cleaned.starts_with("[Error") {
            return Err(Rejection::UpstreamError);
        }
        Ok(())
    }

    pub fn stream_cleaner(&self) -> StreamCleaner<'_> {
        StreamCleaner {
            validator: self,
            hold: self.agent_name.chars().count() + 6,
            head: String::new(),
            state: StreamState::Holding,
        }
    }

    /// Clean then validate, returning the text that should be shown and
    /// committed.
    pub fn check(&self, raw: &str) -> Result<String, Rejection> {
        let cleaned = self.clean(raw);
        self.validate(&cleaned)?;
        Ok(cleaned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Holding,
    Released,
    Muted,
}

/// Applies the speaker-tag cleanup to a response while it streams.
///
/// The opening characters are held back until the tag can be recognised,
/// then stripped; everything after passes straight through.  A response
/// that opens as the user is muted entirely.
pub struct StreamCleaner<'a> {
    validator: &'a ResponseValidator,
    hold: usize,
    head: String,
    state: StreamState,
}

impl StreamCleaner<'_> {
    /// Feed one raw fragment, returning the text that may be shown now.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        match self.state {
            StreamState::Muted => None,
            StreamState::Released => Some(fragment.to_string()),
            StreamState::Holding => {
                self.head.push_str(fragment);
                if self.head.trim_start().chars().count() < self.hold {
                    return None;
                }
                self.release()
            }
        }
    }

    /// Flush a head that never grew past the hold window.
    pub fn finish(&mut self) -> Option<String> {
        match self.state {
            StreamState::Holding => self.release(),
            StreamState::Released | StreamState::Muted => None,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.state == StreamState::Muted
    }

    fn release(&mut self) -> Option<String> {
        let head = std::mem::take(&mut self.head);
        let body = self.validator.strip_speaker(&head);
        if self.validator.speaks_as_user(body) {
            self.state = StreamState::Muted;
            return None;
        }
        self.state = StreamState::Released;
        (!body.is_empty()).then(|| body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ResponseValidator {
        ResponseValidator::new("Wren", "Sam", "*Wren is lost in a daydream.*")
    }

    #[test]
    fn strips_agent_tag_and_leading_punctuation() {
        let v = validator();
        assert_eq!(v.clean("[Wren]: Hello there"), "Hello there");
        assert_eq!(v.clean("[Wren], - hi Sam"), "hi Sam");
        assert_eq!(v.clean("Wren: good morning"), "good morning");
        assert_eq!(v.clean("  plain text  "), "plain text");
    }

    #[test]
    fn accepts_ordinary_dialogue() {
        assert_eq!(
            validator().check("[Wren]: The tide is high today."),
            Ok("The tide is high today.".to_string())
        );
    }

    #[test]
    fn rejects_short_output() {
        assert_eq!(validator().check("[Wren]: k"), Err(Rejection::TooShort));
        assert_eq!(validator().check("   "), Err(Rejection::TooShort));
    }

    #[test]
    fn rejects_user_impersonation() {
        let v = validator();
        assert_eq!(v.check("[User]: hello"), Err(Rejection::Impersonation));
        assert_eq!(v.check("Sam: I think so"), Err(Rejection::Impersonation));
        assert_eq!(
            v.check("Sure thing.\n[User]: thanks"),
            Err(Rejection::Impersonation)
        );
    }

    #[test]
    fn rejects_fallback_and_upstream_errors() {
        let v = validator();
        assert_eq!(
            v.check("*Wren is lost in a daydream.*"),
            Err(Rejection::Fallback)
        );
        assert_eq!(
            v.check("[Error: connection refused]"),
            Err(Rejection::UpstreamError)
        );
    }

    fn stream(v: &ResponseValidator, fragments: &[&str]) -> (String, bool) {
        let mut cleaner = v.stream_cleaner();
        let mut shown = String::new();
        for fragment in fragments {
            if let Some(text) = cleaner.push(fragment) {
                shown.push_str(&text);
            }
        }
        if let Some(text) = cleaner.finish() {
            shown.push_str(&text);
        }
        (shown, cleaner.is_muted())
    }

    #[test]
    fn streamed_speaker_tag_is_stripped_across_fragments() {
        let v = validator();
        let (shown, muted) = stream(&v, &["[Wr", "en]: Hel", "lo there", " friend"]);
        assert_eq!(shown, "Hello there friend");
        assert!(!muted);
        assert_eq!(shown, v.clean("[Wren]: Hello there friend"));
    }

    #[test]
    fn short_streamed_reply_is_flushed_on_finish() {
        let (shown, _) = stream(&validator(), &["[Wren]:", " Hi"]);
        assert_eq!(shown, "Hi");
    }

    #[test]
    fn streamed_impersonation_is_muted() {
        let (shown, muted) = stream(&validator(), &["[Sam]: hey", " are you there"]);
        assert!(shown.is_empty());
        assert!(muted);
    }
}
