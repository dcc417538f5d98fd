/// Deterministic classes of messages that never need a tool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Greeting,
    Gratitude,
    Farewell,
    CapabilityQuestion,
    Substantive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    AnswerDirectly { reason_code: &'static str, reply: String },
}

const GREETINGS: [&str; 9] =
    ["hello", "hi", "hey", "hiya", "howdy", "greetings", "morning", "afternoon", "evening"];
const THANKS: [&str; 5] = ["thanks", "thank", "thx", "ty", "cheers"];
const FAREWELLS: [&str; 5] = ["bye", "goodbye", "later", "farewell", "cya"];
const FILLER: [&str; 12] =
    ["good", "there", "you", "so", "much", "a", "lot", "again", "see", "all", "ok", "okay"];
const CAPABILITY_PHRASES: [&str; 8] = [
    "what can you do",
    "what can you help",
    "what tools",
    "which tools",
    "what do you have access",
    "what are your capabilities",
    "who are you",
    "how can you help",
];
const RAW_OUTPUT_WORDS: [&str; 3] = ["raw", "json", "verbatim"];

/// Classifies a message without consulting the oracle.
pub fn classify(text: &str) -> MessageClass {
    let normalized = normalize_text(text);
    if CAPABILITY_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        return MessageClass::CapabilityQuestion;
    }

    let tokens = tokenize(&normalized);
    if tokens.is_empty() || tokens.len() > 6 {
        return MessageClass::Substantive;
    }

    let only = |vocabulary: &[&str]| {
        tokens.iter().any(|token| vocabulary.contains(&token.as_str()))
            && tokens.iter().all(|token| {
                vocabulary.contains(&token.as_str()) || FILLER.contains(&token.as_str())
            })
    };

    if only(&THANKS) {
        MessageClass::Gratitude
    } else if only(&FAREWELLS) {
        MessageClass::Farewell
    } else if only(&GREETINGS) {
        MessageClass::Greeting
    } else {
        MessageClass::Substantive
    }
}

/// True when the user asked to see the tool output itself.
pub fn wants_raw_output(text: &str) -> bool {
    tokenize(&normalize_text(text)).iter().any(|token| RAW_OUTPUT_WORDS.contains(&token.as_str()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub prefilter_enabled: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { prefilter_enabled: true }
    }
}

impl GuardrailPolicy {
    /// `capabilities` is the one-line summary used for capability questions.
    pub fn evaluate(&self, text: &str, capabilities: &str) -> GuardrailDecision {
        if !self.prefilter_enabled {
            return GuardrailDecision::Allow;
        }
        match classify(text) {
            MessageClass::Substantive => GuardrailDecision::Allow,
            MessageClass::Greeting => GuardrailDecision::AnswerDirectly {
                reason_code: "greeting",
                reply: format!("Hello! {capabilities} What would you like to do?"),
            },
            MessageClass::Gratitude => GuardrailDecision::AnswerDirectly {
                reason_code: "gratitude",
                reply: "You're welcome! Let me know if there is anything else I can look up."
                    .to_string(),
            },
            MessageClass::Farewell => GuardrailDecision::AnswerDirectly {
                reason_code: "farewell",
                reply: "Goodbye! Your conversation is saved if you want to pick it up later."
                    .to_string(),
            },
            MessageClass::CapabilityQuestion => GuardrailDecision::AnswerDirectly {
                reason_code: "capability_question",
                reply: capabilities.to_string(),
            },
        }
    }
}

/// Bounded retry for tool calls: transient failures get `limit` extra attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, error: &parley_core::ToolError, attempts_so_far: u32) -> bool {
        error.is_transient() && attempts_so_far <= self.limit
    }
}

fn normalize_text(text: &str) -> String {
    text.to_ascii_lowercase()
}

fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    for character in text.chars() {
        if character.is_ascii_alphanumeric() || character == '\'' {
            sanitized.push(character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}
