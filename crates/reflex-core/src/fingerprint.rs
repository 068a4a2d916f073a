//! Error fingerprinting for grouping recurring errors.
//!
//! The fingerprint is the first 16 hex characters of a SHA-256 digest over
//! the error class, the first frame's file and function, and a normalized
//! message. Absent components are left out of the joined string rather than
//! padded, so existing fingerprints stay stable.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::backtrace::RawFrame;
use crate::payload::ErrorPayload;

/// Number of hex characters kept from the digest.
pub const FINGERPRINT_LEN: usize = 16;

/// Normalized messages are cut to this many characters.
pub const MAX_MESSAGE_CHARS: usize = 200;

/// Appended to a normalized message that was cut.
const TRUNCATION_MARKER: &str = "...";

const DELIMITER: &str = "|";

/// Compiled patterns for message normalization, applied in field order.
struct MessagePatterns {
    /// Hex runs of 8 or more characters: `abc123defabc`
    hex_ids: Regex,
    /// Standalone decimal numbers: `42`
    numbers: Regex,
    /// Double-quoted literals: `"foo"`
    double_quoted: Regex,
    /// Single-quoted literals: `'foo'`
    single_quoted: Regex,
}

fn build_patterns() -> Option<MessagePatterns> {
    Some(MessagePatterns {
        hex_ids: Regex::new(r"(?i)\b[0-9a-f]{8,}\b").ok()?,
        numbers: Regex::new(r"\b[0-9]+\b").ok()?,
        double_quoted: Regex::new(r#""[^"]*""#).ok()?,
        single_quoted: Regex::new(r"'[^']*'").ok()?,
    })
}

static PATTERNS: LazyLock<Option<MessagePatterns>> = LazyLock::new(build_patterns);

/// First-frame extraction for string frames. Looser than the display parser
/// in `backtrace`: any `<file>:<digits>` prefix yields a file, and the
/// function is read independently of it.
struct FramePatterns {
    /// Everything before the last `:<digits>` on the line: `app/x.rb:10:5` -> `app/x.rb:10`,
    /// `app/x.rb:10:in call` -> `app/x.rb`
    file: Regex,
    /// A backtick-quoted function anywhere: ``in `full_name'``
    function: Regex,
}

fn build_frame_patterns() -> Option<FramePatterns> {
    Some(FramePatterns {
        file: Regex::new(r"(?m)^(.+):[0-9]+").ok()?,
        function: Regex::new(r"in `(.+)'").ok()?,
    })
}

static FRAME_PATTERNS: LazyLock<Option<FramePatterns>> = LazyLock::new(build_frame_patterns);

/// File and function of a first frame, as used by the fingerprint.
///
/// Only string frames and `{"file", "function"}` objects contribute;
/// `{"raw": ..}` wrappers and other values yield neither.
fn frame_file_and_function(frame: &RawFrame) -> (Option<String>, Option<String>) {
    match frame {
        RawFrame::Text(line) => {
            let Some(patterns) = FRAME_PATTERNS.as_ref() else {
                return (None, None);
            };
            let capture = |re: &Regex| {
                re.captures(line)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
            };
            (capture(&patterns.file), capture(&patterns.function))
        }
        RawFrame::Structured(frame) => (frame.file.clone(), frame.function.clone()),
        RawFrame::Raw(_) | RawFrame::Opaque(_) => (None, None),
    }
}

/// Normalize an error message for fingerprinting.
///
/// Replaces hex IDs with `ID`, numbers with `N`, quoted literals with
/// `"..."` / `'...'`, then truncates. Hex IDs go first because they contain
/// digits. Only the fingerprint uses this; stored messages are untouched.
#[must_use]
pub fn normalize_message(message: &str) -> String {
    let Some(patterns) = PATTERNS.as_ref() else {
        return truncate(message);
    };

    let result = patterns.hex_ids.replace_all(message, "ID");
    let result = patterns.numbers.replace_all(&result, "N");
    let result = patterns.double_quoted.replace_all(&result, r#""...""#);
    let result = patterns.single_quoted.replace_all(&result, "'...'");

    truncate(&result)
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &message[..cut]),
        None => message.to_owned(),
    }
}

/// The four inputs of a fingerprint, after extraction and normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintComponents {
    pub error_class: Option<String>,
    pub file: Option<String>,
    pub function: Option<String>,
    pub message: Option<String>,
}

impl FingerprintComponents {
    /// Extract components from a payload.
    ///
    /// File and function come from the first backtrace frame only. A string
    /// frame may contribute either one without the other.
    #[must_use]
    pub fn from_payload(payload: &ErrorPayload) -> Self {
        let (file, function) = payload
            .backtrace
            .first()
            .map(frame_file_and_function)
            .unwrap_or_default();

        Self {
            error_class: payload.error_class.clone(),
            file,
            function,
            message: payload.message.as_deref().map(normalize_message),
        }
    }

    /// The `|`-joined string that gets hashed.
    #[must_use]
    pub fn joined(&self) -> String {
        [
            self.error_class.as_deref(),
            self.file.as_deref(),
            self.function.as_deref(),
            self.message.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(DELIMITER)
    }

    /// Compute the fingerprint: 16 lowercase hex characters.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.joined().as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }
}

/// Compute the grouping fingerprint for a payload.
#[must_use]
pub fn generate(payload: &ErrorPayload) -> String {
    FingerprintComponents::from_payload(payload).fingerprint()
}
