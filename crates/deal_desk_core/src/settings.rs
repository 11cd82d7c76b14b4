//! crates/deal_desk_core/src/settings.rs
//!
//! The configuration snapshot handed to the pipeline and lifecycle engine.
//!
//! A `PipelineSettings` value is immutable once built. `SettingsHandle` lets the
//! process swap in a whole new snapshot (e.g. on SIGHUP) while in-flight requests
//! keep the `Arc` they already loaded.

use arc_swap::ArcSwap;
use chrono::Duration;
use regex::RegexSet;
use std::sync::Arc;

/// Purchase-intent phrases, Russian and English mixed as customers write them.
pub const DEFAULT_PRIORITY_KEYWORDS: &[&str] = &[
    "сколько стоит",
    "цена",
    "стоимость",
    "купить",
    "заказать",
    "оплат",
    "доставк",
    "в наличии",
    "прайс",
    "price",
    "how much",
    "buy",
    "order",
    "delivery",
];

pub const DEFAULT_SLA_THRESHOLD_MINUTES: i64 = 30;
pub const DEFAULT_ANALYSIS_COOLDOWN_MINUTES: i64 = 15;
pub const DEFAULT_BODY_PREVIEW_LIMIT: usize = 512;

/// Case-insensitive substring matcher over a fixed keyword list.
#[derive(Debug, Clone)]
pub struct KeywordSet {
    keywords: Vec<String>,
    matcher: RegexSet,
}

impl KeywordSet {
    pub fn new<I, S>(keywords: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        let matcher = RegexSet::new(keywords.iter().map(|k| format!("(?i){}", regex::escape(k))))?;
        Ok(Self { keywords, matcher })
    }

    pub fn with_defaults() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_PRIORITY_KEYWORDS.iter().copied())
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    /// The keywords found in `text`, in list order.
    pub fn matched<'a>(&'a self, text: &str) -> Vec<&'a str> {
        self.matcher
            .matches(text)
            .into_iter()
            .map(|i| self.keywords[i].as_str())
            .collect()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

/// Everything the ingestion pipeline and lifecycle engine read from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Shared token for the subscription handshake. `None` rejects every handshake.
    pub verify_token: Option<String>,
    /// HMAC secret for delivery signatures. `None` means bootstrap pass-through.
    pub app_secret: Option<String>,
    pub priority_keywords: KeywordSet,
    pub sla_threshold: Duration,
    pub analysis_cooldown: Duration,
    pub body_preview_limit: usize,
}

impl PipelineSettings {
    /// Settings with default thresholds and keywords, and the given secrets.
    pub fn with_secrets(
        verify_token: Option<String>,
        app_secret: Option<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            verify_token,
            app_secret,
            priority_keywords: KeywordSet::with_defaults()?,
            sla_threshold: Duration::minutes(DEFAULT_SLA_THRESHOLD_MINUTES),
            analysis_cooldown: Duration::minutes(DEFAULT_ANALYSIS_COOLDOWN_MINUTES),
            body_preview_limit: DEFAULT_BODY_PREVIEW_LIMIT,
        })
    }
}

/// Shared, swappable pointer to the current settings snapshot.
#[derive(Clone)]
pub struct SettingsHandle {
    current: Arc<ArcSwap<PipelineSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    pub fn snapshot(&self) -> Arc<PipelineSettings> {
        self.current.load_full()
    }

    /// Publishes a new snapshot. Readers holding the old one are unaffected.
    pub fn replace(&self, settings: PipelineSettings) {
        self.current.store(Arc::new(settings));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_match_ignores_case_across_scripts() {
        let set = KeywordSet::with_defaults().expect("keywords compile");
        assert!(set.is_match("Подскажите, СКОЛЬКО СТОИТ доставка?"));
        assert!(set.is_match("How Much is it"));
        assert!(!set.is_match("добрый день"));
        assert_eq!(set.matched("хочу купить"), vec!["купить"]);
    }

    #[test]
    fn keywords_are_matched_literally() {
        let set = KeywordSet::new(["a+b", "  ", "(x)"]).expect("escaped");
        assert_eq!(set.keywords().len(), 2);
        assert!(set.is_match("sum a+b"));
        assert!(!set.is_match("aab"));
        assert!(set.is_match("call (X) now"));
    }

    #[test]
    fn replaced_snapshot_does_not_affect_loaded_one() {
        let handle = SettingsHandle::new(
            PipelineSettings::with_secrets(None, Some("old".into())).expect("settings"),
        );
        let before = handle.snapshot();
        handle.replace(PipelineSettings::with_secrets(None, Some("new".into())).expect("settings"));
        assert_eq!(before.app_secret.as_deref(), Some("old"));
        assert_eq!(handle.snapshot().app_secret.as_deref(), Some("new"));
    }
}
