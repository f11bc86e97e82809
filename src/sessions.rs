//! Per-session usage metrics.
//!
//! Records are created on first touch, capped in number (least recently
//! updated record evicted first) and dropped once idle for longer than the
//! TTL. Expiry is checked on every access; there is no background sweeper.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::SessionsConfig;
use crate::resolver::ProviderKind;

/// `(caller identity, session id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub identity: String,
    pub session_id: Option<String>,
}

impl SessionKey {
    pub fn new(identity: impl Into<String>, session_id: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            session_id: session_id.filter(|id| !id.is_empty()).map(str::to_string),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(id) => write!(f, "{}|sid:{}", self.identity, id),
            None => write!(f, "{}|anon", self.identity),
        }
    }
}

/// Success/error counts for one provider.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub success: u64,
    pub error: u64,
}

/// Per-provider outcome counts, with `none` for echo answers.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ProviderCounts {
    pub openai: OutcomeCounts,
    pub perplexity: OutcomeCounts,
    pub none: OutcomeCounts,
}

impl ProviderCounts {
    fn slot(&mut self, provider: Option<ProviderKind>) -> &mut OutcomeCounts {
        match provider {
            Some(ProviderKind::OpenAi) => &mut self.openai,
            Some(ProviderKind::Perplexity) => &mut self.perplexity,
            None => &mut self.none,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub total_ms: u64,
    pub count: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

impl LatencyStats {
    fn add(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.total_ms += ms;
        self.count += 1;
        self.max_ms = self.max_ms.max(ms);
        self.avg_ms = self.total_ms as f64 / self.count as f64;
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Counters for one session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_key: String,
    pub session_id: Option<String>,
    pub requests: u64,
    pub answer_requests: u64,
    pub answer_errors: u64,
    pub stream_requests: u64,
    pub stream_successes: u64,
    pub stream_errors: u64,
    pub provider: ProviderCounts,
    pub latency: LatencyStats,
    pub usage: UsageStats,
    #[serde(skip)]
    created_at: Instant,
    #[serde(skip)]
    updated_at: Instant,
}

impl SessionRecord {
    fn new(key: &SessionKey, now: Instant) -> Self {
        Self {
            session_key: key.to_string(),
            session_id: key.session_id.clone(),
            requests: 0,
            answer_requests: 0,
            answer_errors: 0,
            stream_requests: 0,
            stream_successes: 0,
            stream_errors: 0,
            provider: ProviderCounts::default(),
            latency: LatencyStats::default(),
            usage: UsageStats::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Answer errors as a percentage of answer requests.
    pub fn error_rate(&self) -> f64 {
        if self.answer_requests == 0 {
            return 0.0;
        }
        self.answer_errors as f64 / self.answer_requests as f64 * 100.0
    }

    /// Time since the record was created.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    fn apply(&mut self, event: &MetricsEvent) {
        self.requests += 1;
        self.latency.add(event.latency);

        if event.kind != EventKind::Answer {
            return;
        }

        self.answer_requests += 1;
        if !event.success {
            self.answer_errors += 1;
        }
        if event.stream {
            self.stream_requests += 1;
            if event.success {
                self.stream_successes += 1;
            } else {
                self.stream_errors += 1;
            }
        }

        let slot = self.provider.slot(event.provider);
        if event.success {
            slot.success += 1;
        } else {
            slot.error += 1;
        }

        self.usage.prompt_tokens += event.prompt_tokens;
        self.usage.response_tokens += event.response_tokens;
        self.usage.total_tokens = self.usage.prompt_tokens + self.usage.response_tokens;
        self.usage.estimated_cost_usd += event.estimated_cost();
    }
}

/// What kind of request an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A provider-backed answer (ask, code, summarize, stream).
    Answer,
    /// Any other command; counts toward requests and latency only.
    Command,
}

/// One finished request.
#[derive(Debug, Clone)]
pub struct MetricsEvent {
    pub kind: EventKind,
    pub stream: bool,
    pub success: bool,
    pub provider: Option<ProviderKind>,
    pub latency: Duration,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    /// USD per 1k prompt tokens.
    pub input_rate: f64,
    /// USD per 1k response tokens.
    pub output_rate: f64,
}

impl MetricsEvent {
    /// A non-answer command.
    pub fn command(latency: Duration) -> Self {
        Self {
            kind: EventKind::Command,
            stream: false,
            success: true,
            provider: None,
            latency,
            prompt_tokens: 0,
            response_tokens: 0,
            input_rate: 0.0,
            output_rate: 0.0,
        }
    }

    fn estimated_cost(&self) -> f64 {
        self.prompt_tokens as f64 / 1000.0 * self.input_rate
            + self.response_tokens as f64 / 1000.0 * self.output_rate
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Bounded, TTL-expiring store of session records.
#[derive(Debug)]
pub struct SessionMetrics {
    max_sessions: usize,
    ttl: Duration,
    records: Mutex<HashMap<SessionKey, SessionRecord>>,
}

impl SessionMetrics {
    pub fn new(config: &SessionsConfig) -> Self {
        Self {
            max_sessions: config.max_sessions.max(1),
            ttl: config.ttl(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Fold `event` into the record for `key`.
    pub fn record(&self, key: &SessionKey, event: &MetricsEvent) {
        self.record_at(key, event, Instant::now())
    }

    /// [`record`](Self::record) with an explicit clock.
    pub fn record_at(&self, key: &SessionKey, event: &MetricsEvent, now: Instant) {
        let mut records = self.records.lock();
        let record = self.ensure(&mut records, key, now);
        record.apply(event);
        record.updated_at = now;
    }

    /// Current record for `key`, created empty when absent.
    pub fn get(&self, key: &SessionKey) -> SessionRecord {
        self.get_at(key, Instant::now())
    }

    /// [`get`](Self::get) with an explicit clock.
    pub fn get_at(&self, key: &SessionKey, now: Instant) -> SessionRecord {
        let mut records = self.records.lock();
        self.ensure(&mut records, key, now).clone()
    }

    /// Whether a live record exists for `key`, without creating one.
    pub fn contains_at(&self, key: &SessionKey, now: Instant) -> bool {
        let mut records = self.records.lock();
        self.purge_expired(&mut records, now);
        records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure<'a>(
        &self,
        records: &'a mut HashMap<SessionKey, SessionRecord>,
        key: &SessionKey,
        now: Instant,
    ) -> &'a mut SessionRecord {
        self.purge_expired(records, now);

        if !records.contains_key(key) && records.len() >= self.max_sessions {
            evict_least_recently_updated(records);
        }

        records
            .entry(key.clone())
            .or_insert_with(|| SessionRecord::new(key, now))
    }

    fn purge_expired(&self, records: &mut HashMap<SessionKey, SessionRecord>, now: Instant) {
        let ttl = self.ttl;
        records.retain(|_, record| now.saturating_duration_since(record.updated_at) <= ttl);
    }
}

fn evict_least_recently_updated(records: &mut HashMap<SessionKey, SessionRecord>) {
    let oldest = records
        .iter()
        .min_by_key(|(_, record)| record.updated_at)
        .map(|(key, _)| key.clone());

    if let Some(key) = oldest {
        tracing::debug!(session = %key, "Evicting least recently updated session");
        records.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_sessions: usize, ttl_ms: u64) -> SessionMetrics {
        SessionMetrics::new(&SessionsConfig {
            max_sessions,
            ttl_ms,
        })
    }

    fn answer(success: bool, stream: bool, latency_ms: u64) -> MetricsEvent {
        MetricsEvent {
            kind: EventKind::Answer,
            stream,
            success,
            provider: Some(ProviderKind::OpenAi),
            latency: Duration::from_millis(latency_ms),
            prompt_tokens: 1000,
            response_tokens: 2000,
            input_rate: 0.5,
            output_rate: 1.0,
        }
    }

    #[test]
    fn test_session_key_format() {
        assert_eq!(SessionKey::new("1.2.3.4", Some("abc")).to_string(), "1.2.3.4|sid:abc");
        assert_eq!(SessionKey::new("1.2.3.4", None).to_string(), "1.2.3.4|anon");
        assert_eq!(SessionKey::new("1.2.3.4", Some("")).to_string(), "1.2.3.4|anon");
    }

    #[test]
    fn test_counters_and_averages() {
        let store = store(10, 60_000);
        let key = SessionKey::new("ip", Some("s1"));
        let now = Instant::now();

        store.record_at(&key, &answer(true, true, 100), now);
        store.record_at(&key, &answer(false, false, 300), now);
        store.record_at(&key, &MetricsEvent::command(Duration::from_millis(20)), now);

        let record = store.get_at(&key, now);
        assert_eq!(record.requests, 3);
        assert_eq!(record.answer_requests, 2);
        assert_eq!(record.answer_errors, 1);
        assert_eq!(record.stream_requests, 1);
        assert_eq!(record.stream_successes, 1);
        assert_eq!(record.stream_errors, 0);
        assert_eq!(record.provider.openai, OutcomeCounts { success: 1, error: 1 });
        assert_eq!(record.latency.total_ms, 420);
        assert_eq!(record.latency.count, 3);
        assert_eq!(record.latency.max_ms, 300);
        assert!((record.latency.avg_ms - 140.0).abs() < f64::EPSILON);
        assert_eq!(record.usage.total_tokens, 6000);
        assert!((record.usage.estimated_cost_usd - 5.0).abs() < 1e-9);
        assert!((record.error_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evicts_least_recently_updated() {
        let store = store(2, 60_000);
        let start = Instant::now();
        let a = SessionKey::new("a", None);
        let b = SessionKey::new("b", None);
        let c = SessionKey::new("c", None);

        store.record_at(&a, &MetricsEvent::command(Duration::ZERO), start);
        store.record_at(&b, &MetricsEvent::command(Duration::ZERO), start + Duration::from_secs(1));
        store.record_at(&a, &MetricsEvent::command(Duration::ZERO), start + Duration::from_secs(2));
        store.record_at(&c, &MetricsEvent::command(Duration::ZERO), start + Duration::from_secs(3));

        let now = start + Duration::from_secs(3);
        assert_eq!(store.len(), 2);
        assert!(store.contains_at(&a, now));
        assert!(!store.contains_at(&b, now));
        assert!(store.contains_at(&c, now));
    }

    #[test]
    fn test_expired_records_are_dropped() {
        let store = store(10, 60_000);
        let start = Instant::now();
        let key = SessionKey::new("ip", Some("old"));

        store.record_at(&key, &answer(true, false, 10), start);
        assert!(store.contains_at(&key, start + Duration::from_secs(60)));
        assert!(!store.contains_at(&key, start + Duration::from_secs(61)));

        let fresh = store.get_at(&key, start + Duration::from_secs(61));
        assert_eq!(fresh.requests, 0);
    }

    #[test]
    fn test_get_creates_empty_record() {
        let store = store(10, 60_000);
        let key = SessionKey::new("ip", None);
        let record = store.get(&key);
        assert_eq!(record.requests, 0);
        assert_eq!(record.error_rate(), 0.0);
        assert_eq!(record.session_key, "ip|anon");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let store = store(10, 60_000);
        let record = store.get(&SessionKey::new("ip", Some("x")));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sessionKey"], "ip|sid:x");
        assert!(json.get("answerRequests").is_some());
        assert!(json["latency"].get("avgMs").is_some());
        assert!(json["provider"]["none"].get("success").is_some());
        assert!(json.get("createdAt").is_none());
    }
}
