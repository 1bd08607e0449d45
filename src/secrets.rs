// src/secrets.rs
// Keeps credentials out of log output.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing_subscriber::fmt::MakeWriter;

pub const REDACTED: &str = "<sensitive>";

#[derive(Debug, Default)]
struct Registry {
    secrets: BTreeSet<String>,
    // One alternation over every secret, longest first. `None` while empty or
    // if the pattern could not be built, in which case nothing is let through.
    pattern: Option<Regex>,
}

impl Registry {
    fn rebuild(&mut self) {
        let mut ordered: Vec<&String> = self.secrets.iter().collect();
        ordered.sort_by(|a, b| b.len().cmp(&a.len()));
        let alternation = ordered
            .iter()
            .map(|s| regex::escape(s))
            .collect::<Vec<_>>()
            .join("|");
        self.pattern = Regex::new(&alternation).ok();
    }
}

/// Set of strings that get replaced with [`REDACTED`] wherever they appear.
#[derive(Debug, Default)]
pub struct SecretFilter {
    registry: RwLock<Registry>,
}

/// Forms a secret takes in log and serializer output: as is, JSON-escaped and
/// Debug-escaped.
fn escaped_forms(secret: &str) -> impl Iterator<Item = String> {
    let json = serde_json::to_string(secret).unwrap_or_default();
    let debug = format!("{:?}", secret);
    [secret.to_string(), unquote(&json), unquote(&debug)]
        .into_iter()
        .filter(|form| !form.is_empty())
}

fn unquote(quoted: &str) -> String {
    quoted
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(quoted)
        .to_string()
}

impl SecretFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide filter used by the log writer.
    pub fn global() -> &'static Arc<SecretFilter> {
        static GLOBAL: OnceLock<Arc<SecretFilter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SecretFilter::new()))
    }

    /// Registers secrets. Empty strings are ignored, they would match everywhere.
    pub fn set<I, S>(&self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.secrets.len();
        for secret in secrets {
            let secret = secret.as_ref();
            if !secret.is_empty() {
                registry.secrets.extend(escaped_forms(secret));
            }
        }
        if registry.secrets.len() != before {
            registry.rebuild();
        }
    }

    /// Number of registered patterns, escaped forms included.
    pub fn len(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces every secret in one leftmost-longest pass.
    pub fn redact(&self, text: &str) -> String {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if registry.secrets.is_empty() {
            return text.to_string();
        }
        match &registry.pattern {
            Some(pattern) => pattern.replace_all(text, REDACTED).into_owned(),
            None => REDACTED.to_string(),
        }
    }

    /// Redacts every string inside `value`, before it is serialized and escaped.
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.redact(s),
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact_value(item)),
            Value::Object(map) => map.values_mut().for_each(|item| self.redact_value(item)),
            _ => {}
        }
    }
}

/// Wraps a writer, redacting every chunk before passing it on.
pub struct RedactingWriter<'a, W> {
    inner: W,
    filter: &'a SecretFilter,
}

impl<'a, W: Write> RedactingWriter<'a, W> {
    pub fn new(inner: W, filter: &'a SecretFilter) -> Self {
        Self { inner, filter }
    }
}

impl<W: Write> Write for RedactingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        self.inner.write_all(self.filter.redact(&text).as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// `MakeWriter` for the fmt subscriber. Defaults to stderr.
pub struct RedactingMakeWriter<M = fn() -> io::Stderr> {
    inner: M,
    filter: Arc<SecretFilter>,
}

impl RedactingMakeWriter {
    pub fn stderr(filter: Arc<SecretFilter>) -> Self {
        RedactingMakeWriter {
            inner: io::stderr,
            filter,
        }
    }
}

impl<M> RedactingMakeWriter<M> {
    pub fn with_inner(inner: M, filter: Arc<SecretFilter>) -> Self {
        RedactingMakeWriter { inner, filter }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<'a, M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer(), &self.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn redacts_registered_secrets() {
        let filter = SecretFilter::new();
        filter.set(["hunter2", "tok-123"]);
        assert_eq!(
            filter.redact("user pw=hunter2 token=tok-123"),
            "user pw=<sensitive> token=<sensitive>"
        );
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let filter = SecretFilter::new();
        filter.set(["", "x1"]);
        assert_eq!(filter.len(), 1);
        assert_eq!(filter.redact("abc"), "abc");
    }

    #[test]
    fn longer_secret_wins() {
        let filter = SecretFilter::new();
        filter.set(["abc", "abcdef"]);
        assert_eq!(filter.redact("key=abcdef"), "key=<sensitive>");
    }

    #[test]
    fn writer_redacts_before_forwarding() {
        let filter = SecretFilter::new();
        filter.set(["s3cret"]);
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut out, &filter);
            write!(writer, "password is s3cret").unwrap();
        }
        assert_eq!(String::from_utf8(out).unwrap(), "password is <sensitive>");
    }

    #[test]
    fn subscriber_output_is_redacted() {
        let filter = Arc::new(SecretFilter::new());
        filter.set(["s3cret"]);
        let buf = SharedBuf::default();
        let sink = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(RedactingMakeWriter::with_inner(move || sink.clone(), filter))
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(password = "s3cret", "logging in");
        });

        let logged = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("logging in"));
        assert!(logged.contains("<sensitive>"));
        assert!(!logged.contains("s3cret"));
    }

    #[test]
    fn markers_are_not_redacted_again() {
        let filter = SecretFilter::new();
        filter.set(["longsecret", "sit"]);
        assert_eq!(filter.redact("x=longsecret y=sit"), "x=<sensitive> y=<sensitive>");
    }

    #[test]
    fn escaped_forms_are_redacted() {
        let filter = SecretFilter::new();
        filter.set([r#"Pa"ss\w0rd!"#]);
        let json = serde_json::to_string(&serde_json::json!({"password": r#"Pa"ss\w0rd!"#})).unwrap();
        assert_eq!(filter.redact(&json), r#"{"password":"<sensitive>"}"#);
        assert_eq!(filter.redact(r#"password="Pa\"ss\\w0rd!""#), r#"password="<sensitive>""#);
    }

    #[test]
    fn values_are_redacted_in_place() {
        let filter = SecretFilter::new();
        filter.set(["tok-9"]);
        let mut value = serde_json::json!({"token": "tok-9", "nested": ["a tok-9 b", 3], "other": null});
        filter.redact_value(&mut value);
        assert_eq!(
            value,
            serde_json::json!({"token": "<sensitive>", "nested": ["a <sensitive> b", 3], "other": null})
        );
    }

    #[test]
    fn json_subscriber_output_is_redacted() {
        let filter = Arc::new(SecretFilter::new());
        filter.set([r#"Pa"ss\w0rd!"#]);
        let buf = SharedBuf::default();
        let sink = buf.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(RedactingMakeWriter::with_inner(move || sink.clone(), filter))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(password = r#"Pa"ss\w0rd!"#, "logging in");
        });

        let logged = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(logged.contains("logging in"));
        assert!(logged.contains("<sensitive>"));
        assert!(!logged.contains("w0rd"));
    }
}
