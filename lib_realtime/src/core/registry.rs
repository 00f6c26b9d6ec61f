//! # Topic Registry
//!
//! Tracks which handlers are interested in which topic patterns and answers
//! "who should receive topic X?" in registration order.
//!
//! Patterns are regular expressions anchored at both ends, so `record/.*`
//! matches `record/123` and `record/` but never `recordx/1`. Matching is
//! case-sensitive and the empty topic never matches.
//!
//! Like a reference-counted subscription table, the registry counts handlers
//! per pattern: `listen` reports whether it added the first handler for a
//! pattern and `unlisten` whether it removed the last one, so the owner sends
//! exactly one subscribe / unsubscribe to the server per pattern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::core::errors::ClientError;
use crate::protocol::has_separator;

/// Callback for provider discovery: `(subscription name, is_subscribed)`.
pub type DiscoveryHandler = dyn Fn(&str, bool) + Send + Sync;

/// Opaque token identifying one registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    pattern: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

/// Result of `TopicRegistry::listen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOutcome {
    pub handle: SubscriptionHandle,
    /// True when no handler was registered for this pattern before.
    pub first_for_pattern: bool,
}

struct Entry<H: ?Sized> {
    id: u64,
    pattern: String,
    matcher: Regex,
    handler: Arc<H>,
}

struct Inner<H: ?Sized> {
    entries: Vec<Entry<H>>,
    counts: HashMap<String, u32>,
    next_id: u64,
}

/// Pattern → handler registry, generic over the handler type.
pub struct TopicRegistry<H: ?Sized> {
    inner: Mutex<Inner<H>>,
}

impl<H: ?Sized> Default for TopicRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiles a pattern into an anchored matcher.
pub fn compile_pattern(pattern: &str) -> Result<Regex, ClientError> {
    if pattern.is_empty() {
        return Err(ClientError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern must not be empty".to_string(),
        });
    }
    if has_separator(pattern) {
        return Err(ClientError::InvalidPattern {
            pattern: pattern.escape_debug().to_string(),
            reason: "pattern contains a protocol separator".to_string(),
        });
    }
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| ClientError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

impl<H: ?Sized> TopicRegistry<H> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                counts: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Registers `handler` for `pattern`. Registering the same handler (same
    /// `Arc`) for the same pattern again returns the existing handle.
    pub fn listen(&self, pattern: &str, handler: Arc<H>) -> Result<ListenOutcome, ClientError> {
        let mut inner = self.inner.lock().expect("Registry lock poisoned");

        if let Some(existing) = inner
            .entries
            .iter()
            .find(|e| e.pattern == pattern && Arc::ptr_eq(&e.handler, &handler))
        {
            return Ok(ListenOutcome {
                handle: SubscriptionHandle {
                    id: existing.id,
                    pattern: existing.pattern.clone(),
                },
                first_for_pattern: false,
            });
        }

        let matcher = match inner.entries.iter().find(|e| e.pattern == pattern) {
            Some(e) => e.matcher.clone(),
            None => compile_pattern(pattern)?,
        };

        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            pattern: pattern.to_string(),
            matcher,
            handler,
        });

        let count = inner.counts.entry(pattern.to_string()).or_insert(0);
        *count += 1;

        Ok(ListenOutcome {
            handle: SubscriptionHandle {
                id,
                pattern: pattern.to_string(),
            },
            first_for_pattern: *count == 1,
        })
    }

    /// Removes a registration. Returns `Some(true)` when it was the last one
    /// for its pattern, `Some(false)` when others remain, `None` if unknown.
    pub fn unlisten(&self, handle: &SubscriptionHandle) -> Option<bool> {
        let mut inner = self.inner.lock().expect("Registry lock poisoned");
        let position = inner.entries.iter().position(|e| e.id == handle.id)?;
        let entry = inner.entries.remove(position);

        let remaining = match inner.counts.get_mut(&entry.pattern) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.counts.remove(&entry.pattern);
            log::debug!("Last handler for pattern '{}' removed", entry.pattern);
        }
        Some(remaining == 0)
    }

    /// Handlers whose pattern matches `topic`, in registration order.
    pub fn match_topic(&self, topic: &str) -> Vec<Arc<H>> {
        if topic.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.lock().expect("Registry lock poisoned");
        inner
            .entries
            .iter()
            .filter(|e| e.matcher.is_match(topic))
            .map(|e| Arc::clone(&e.handler))
            .collect()
    }

    /// Distinct active patterns, in order of first registration.
    pub fn patterns(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("Registry lock poisoned");
        let mut seen = Vec::new();
        for e in &inner.entries {
            if !seen.contains(&e.pattern) {
                seen.push(e.pattern.clone());
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("Registry lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registration.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("Registry lock poisoned");
        inner.entries.clear();
        inner.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Handler = dyn Fn(&str) + Send + Sync;

    fn noop() -> Arc<Handler> {
        Arc::new(|_: &str| {})
    }

    #[test]
    fn test_anchored_prefix_wildcard() {
        let registry: TopicRegistry<Handler> = TopicRegistry::new();
        registry.listen("record/.*", noop()).unwrap();

        assert_eq!(registry.match_topic("record/123").len(), 1);
        assert_eq!(registry.match_topic("record/").len(), 1);
        assert!(registry.match_topic("recordx/1").is_empty());
        assert!(registry.match_topic("xrecord/1").is_empty());
        assert!(registry.match_topic("Record/1").is_empty());
        assert!(registry.match_topic("").is_empty());
    }

    #[test]
    fn test_wildcard_only_pattern_never_matches_empty_topic() {
        let registry: TopicRegistry<Handler> = TopicRegistry::new();
        registry.listen(".*", noop()).unwrap();
        assert!(registry.match_topic("").is_empty());
        assert_eq!(registry.match_topic("anything").len(), 1);
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let registry: TopicRegistry<Handler> = TopicRegistry::new();
        assert!(matches!(registry.listen("", noop()), Err(ClientError::InvalidPattern { .. })));
        assert!(matches!(registry.listen("event/(", noop()), Err(ClientError::InvalidPattern { .. })));
        assert!(matches!(registry.listen("event/\u{1f}.*", noop()), Err(ClientError::InvalidPattern { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_listen_is_idempotent() {
        let registry: TopicRegistry<Handler> = TopicRegistry::new();
        let handler = noop();
        let first = registry.listen("event/.*", Arc::clone(&handler)).unwrap();
        let again = registry.listen("event/.*", Arc::clone(&handler)).unwrap();

        assert!(first.first_for_pattern);
        assert!(!again.first_for_pattern);
        assert_eq!(first.handle, again.handle);
        assert_eq!(registry.match_topic("event/foo").len(), 1);
    }

    #[test]
    fn test_registration_order_and_refcount() {
        let registry: TopicRegistry<Handler> = TopicRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, pattern) in ["event/.*", "event/foo", "event/.*"].iter().enumerate() {
            let sink = Arc::clone(&order);
            let handler: Arc<Handler> = Arc::new(move |_: &str| sink.lock().unwrap().push(i));
            handles.push(registry.listen(pattern, handler).unwrap());
        }
        assert!(handles[0].first_for_pattern);
        assert!(handles[1].first_for_pattern);
        assert!(!handles[2].first_for_pattern);
        assert_eq!(registry.patterns(), vec!["event/.*".to_string(), "event/foo".to_string()]);

        for h in registry.match_topic("event/foo") {
            h("event/foo");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        assert_eq!(registry.unlisten(&handles[0].handle), Some(false));
        assert_eq!(registry.unlisten(&handles[2].handle), Some(true));
        assert_eq!(registry.unlisten(&handles[2].handle), None);
        assert_eq!(registry.patterns(), vec!["event/foo".to_string()]);
    }
}
