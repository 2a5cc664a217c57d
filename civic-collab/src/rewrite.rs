//! Style rewriting: the remote rewrite service, its deterministic local
//! fallback, and the `/rewrite` line command.
//!
//! ```text
//! "/rewrite this is fine"  ──find_rewrite_request──►  "this is fine"
//!                                                          │
//!                 HttpRewriter::rewrite ◄──────────────────┤
//!                    │ error                               │
//!                    ▼                                     │
//!              fallback_rewrite ──► "this is fantastic!" ◄─┘
//!                    │
//!                    ▼
//!              apply_rewrite: every `/rewrite` line replaced
//! ```

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Line command that triggers a rewrite.
pub const REWRITE_COMMAND: &str = "/rewrite";

/// Tone of an editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleTag {
    Happy,
    Sad,
}

impl StyleTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StyleTag::Happy => "happy",
            StyleTag::Sad => "sad",
        }
    }

    /// Starter text shown in an empty editor. Never seeded into a room.
    pub fn placeholder(&self) -> &'static str {
        match self {
            StyleTag::Happy => HAPPY_PLACEHOLDER,
            StyleTag::Sad => SAD_PLACEHOLDER,
        }
    }

    /// Local cache key, `"<app-namespace>-<tag>"`.
    pub fn cache_key(&self, app_namespace: &str) -> String {
        format!("{app_namespace}-{}", self.as_str())
    }
}

impl fmt::Display for StyleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StyleTag {
    type Err = RewriteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "happy" => Ok(StyleTag::Happy),
            "sad" => Ok(StyleTag::Sad),
            other => Err(RewriteError::UnknownStyle(other.to_string())),
        }
    }
}

const HAPPY_PLACEHOLDER: &str = "Welcome to the Happy Editor! ✨ This is your space to write \
positive, uplifting content. Here are some ideas to get you started: Gratitude journaling - \
What are you thankful for today? Goal setting - What exciting plans do you have? Positive \
reflections - What made you smile recently? Try typing some text and then use /rewrite to \
make it even more positive! Start writing your happy thoughts below...";

const SAD_PLACEHOLDER: &str = "Welcome to the Contemplative Editor 🌙 This is your space for \
deeper, more introspective writing. Use this editor to explore: Personal reflections - Process \
your thoughts and feelings Creative writing - Dive into poetry, stories, or \
stream-of-consciousness Problem solving - Work through challenges with thoughtful analysis Try \
typing some text and then use /rewrite to make it more contemplative! Begin your thoughtful \
writing below...";

#[derive(Debug, Clone, Error)]
pub enum RewriteError {
    #[error("rewrite service is not configured (missing {0})")]
    NotConfigured(&'static str),
    #[error("rewrite request failed: {0}")]
    Http(String),
    #[error("rewrite service returned status {0}")]
    Status(u16),
    #[error("unknown style tag {0:?}")]
    UnknownStyle(String),
}

/// Something that can restyle a piece of text.
pub trait RewriteService: Send + Sync {
    fn rewrite<'a>(
        &'a self,
        text: &'a str,
        style: StyleTag,
    ) -> BoxFuture<'a, Result<String, RewriteError>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RewriteRequest<'a> {
    text: &'a str,
    style_tag: StyleTag,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    rewritten_text: String,
}

/// JSON-over-HTTP rewrite service.
pub struct HttpRewriter {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: Option<String>,
}

impl HttpRewriter {
    pub fn new(endpoint: Option<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.api_key.is_some()
    }

    async fn call(&self, text: &str, style: StyleTag) -> Result<String, RewriteError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(RewriteError::NotConfigured("endpoint"))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(RewriteError::NotConfigured("API key"))?;

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(api_key)
            .json(&RewriteRequest {
                text,
                style_tag: style,
            })
            .send()
            .await
            .map_err(|e| RewriteError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RewriteError::Status(response.status().as_u16()));
        }

        let body: RewriteResponse = response
            .json()
            .await
            .map_err(|e| RewriteError::Http(e.to_string()))?;
        Ok(body.rewritten_text.trim().to_string())
    }
}

impl RewriteService for HttpRewriter {
    fn rewrite<'a>(
        &'a self,
        text: &'a str,
        style: StyleTag,
    ) -> BoxFuture<'a, Result<String, RewriteError>> {
        Box::pin(self.call(text, style))
    }
}

/// Service that always uses [`fallback_rewrite`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRewriter;

impl RewriteService for LocalRewriter {
    fn rewrite<'a>(
        &'a self,
        text: &'a str,
        style: StyleTag,
    ) -> BoxFuture<'a, Result<String, RewriteError>> {
        Box::pin(async move { Ok(fallback_rewrite(text, style)) })
    }
}

// ─── Local fallback ────────────────────────────────────────────────

const HAPPY_WORDS: &[(&str, &str)] = &[
    ("okay", "absolutely wonderful"),
    ("fine", "fantastic"),
    ("good", "amazing"),
    ("great", "absolutely spectacular"),
    ("nice", "incredible"),
    ("bad", "challenging but rewarding"),
    ("difficult", "exciting challenge"),
    ("problem", "opportunity"),
    ("tired", "ready for rest and rejuvenation"),
    ("stressed", "energized and focused"),
];

const SAD_WORDS: &[(&str, &str)] = &[
    ("okay", "disappointing"),
    ("fine", "mediocre"),
    ("good", "barely acceptable"),
    ("great", "overhyped"),
    ("nice", "somewhat tolerable"),
    ("bad", "terrible"),
    ("difficult", "overwhelming"),
    ("problem", "insurmountable obstacle"),
    ("tired", "utterly exhausted"),
    ("stressed", "overwhelmed and anxious"),
];

/// Deterministic word-substitution rewrite used when the service fails.
pub fn fallback_rewrite(text: &str, style: StyleTag) -> String {
    let table = match style {
        StyleTag::Happy => HAPPY_WORDS,
        StyleTag::Sad => SAD_WORDS,
    };
    let mut result = substitute_words(text, table);

    match style {
        StyleTag::Happy => {
            if result.ends_with('.') {
                result.pop();
                result.push('!');
            }
            result = replace_phrases(&result, &["i am", "i'm"], "I'm absolutely");
            if !result.contains('!') && !result.contains('?') {
                result.push('!');
            }
        }
        StyleTag::Sad => {
            if result.ends_with('!') {
                result.pop();
                result.push('.');
            }
            result = replace_phrases(&result, &["i am", "i'm"], "I find myself");
            if !result.contains('.') && !result.contains('?') {
                result.push_str("...");
            }
        }
    }
    result
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace whole words (ASCII word boundaries, case-insensitive).
fn substitute_words(text: &str, table: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| {
        if word.is_empty() {
            return;
        }
        let lower = word.to_ascii_lowercase();
        match table.iter().find(|(from, _)| *from == lower) {
            Some((_, to)) => out.push_str(to),
            None => out.push_str(word),
        }
        word.clear();
    };

    for c in text.chars() {
        if is_word_char(c) {
            word.push(c);
        } else {
            flush(&mut word, &mut out);
            out.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}

/// Replace every case-insensitive occurrence of any of `phrases` that sits
/// on word boundaries. Replacement text is not re-scanned.
fn replace_phrases(text: &str, phrases: &[&str], replacement: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < bytes.len() {
        let boundary_before = text[..i].chars().next_back().map_or(true, |c| !is_word_char(c));
        let matched = boundary_before
            .then(|| {
                phrases.iter().find(|phrase| {
                    let end = i + phrase.len();
                    end <= bytes.len()
                        && bytes[i..end].eq_ignore_ascii_case(phrase.as_bytes())
                        && text[end..].chars().next().map_or(true, |c| !is_word_char(c))
                })
            })
            .flatten();

        match matched {
            Some(phrase) => {
                out.push_str(replacement);
                i += phrase.len();
            }
            None => {
                let Some(c) = text[i..].chars().next() else {
                    break;
                };
                out.push(c);
                i += c.len_utf8();
            }
        }
    }
    out
}

// ─── Line command ──────────────────────────────────────────────────

/// Text to rewrite from the first line containing `/rewrite`, with the
/// command removed. `None` if there is no such line or nothing to rewrite.
pub fn find_rewrite_request(text: &str) -> Option<String> {
    let line = text.lines().find(|line| line.contains(REWRITE_COMMAND))?;
    let request = line.replacen(REWRITE_COMMAND, "", 1).trim().to_string();
    (!request.is_empty()).then_some(request)
}

/// Replace every line containing `/rewrite` with `rewritten`.
pub fn apply_rewrite(text: &str, rewritten: &str) -> String {
    text.split('\n')
        .map(|line| {
            if line.contains(REWRITE_COMMAND) {
                rewritten
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
