//! Redaction of secret values in traced lines
//!
//! While a [`SecretGuard`] is alive, the value part of every traced command and reply is replaced
//! by `<redacted>`, so session keys do not end up in logs.

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use regex::Regex;

fn value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.*)([= ]).+$").expect("static pattern"))
}

/// Replace everything after the last `=` or space with `<redacted>`
pub fn redact(text: &str) -> Cow<'_, str> {
    value_pattern().replace(text, "${1}${2}<redacted>")
}

/// Shared redaction switch
#[derive(Debug, Clone, Default)]
pub(crate) struct Redactor {
    active: Arc<AtomicUsize>,
}

impl Redactor {
    pub fn guard(&self) -> SecretGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        SecretGuard {
            active: self.active.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Render a line for logging
    pub fn display(&self, line: &[u8]) -> String {
        let text = String::from_utf8_lossy(line);
        if self.is_active() {
            redact(&text).into_owned()
        } else {
            text.into_owned()
        }
    }
}

/// Keeps redaction enabled until dropped
#[derive(Debug)]
pub struct SecretGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for SecretGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
