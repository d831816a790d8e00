//! Display-side deduplication for one channel's transcript.
//!
//! Every message can legitimately arrive twice: once as the sender's
//! optimistic local copy and once as the transport echo, plus any number
//! of at-least-once redeliveries and history re-fetches. The check runs in
//! two steps, first match wins:
//!
//! 1. identity: the id was already seen;
//! 2. echo: same content and attached product, same side, `createdAt`
//!    within the fuzzy window.
//!
//! Known limitation: two genuinely identical messages typed by the same
//! side inside the window collapse into one. Recommendations of different
//! products are never identical, even with empty text.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::types::{Message, Side};

pub const DEFAULT_FUZZY_WINDOW_MS: i64 = 3_000;
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Fresh,
    DuplicateId,
    /// Collapsed into an earlier message that carries `original_id`.
    DuplicateEcho { original_id: String },
}

impl Verdict {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Verdict::Fresh)
    }
}

#[derive(Debug, Clone)]
struct Fingerprint {
    ids: Vec<String>,
    side: Side,
    digest: [u8; 32],
    created_at: DateTime<Utc>,
}

/// Bounded ring of recently displayed message fingerprints.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    capacity: usize,
    window: Duration,
    recent: VecDeque<Fingerprint>,
    ids: HashSet<String>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Duration::milliseconds(DEFAULT_FUZZY_WINDOW_MS))
    }
}

fn content_digest(message: &Message) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(message.content.as_bytes());
    if let Some(product) = &message.recommendation {
        hasher.update([0u8]);
        hasher.update(product.product_id.as_bytes());
    }
    hasher.finalize().into()
}

impl Deduplicator {
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            recent: VecDeque::with_capacity(capacity),
            ids: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Classifies `message` without recording it.
    pub fn classify(&self, message: &Message) -> Verdict {
        if self.ids.contains(&message.id) {
            return Verdict::DuplicateId;
        }

        let side = message.sender_role.side();
        let digest = content_digest(message);
        self.recent
            .iter()
            .rev()
            .find(|seen| {
                let delta = seen.created_at - message.created_at;
                seen.side == side
                    && seen.digest == digest
                    && delta <= self.window
                    && delta >= -self.window
            })
            .map(|seen| Verdict::DuplicateEcho {
                original_id: seen.ids.first().cloned().unwrap_or_default(),
            })
            .unwrap_or(Verdict::Fresh)
    }

    /// Classifies and, when fresh, records `message`. An echo's id is
    /// remembered as an alias so later redeliveries of it short-circuit on
    /// identity.
    pub fn admit(&mut self, message: &Message) -> Verdict {
        let verdict = self.classify(message);
        match &verdict {
            Verdict::Fresh => self.record(message),
            Verdict::DuplicateEcho { original_id } => {
                let original_id = original_id.clone();
                self.alias(&original_id, &message.id);
            }
            Verdict::DuplicateId => {}
        }
        verdict
    }

    fn record(&mut self, message: &Message) {
        if self.recent.len() == self.capacity {
            if let Some(evicted) = self.recent.pop_front() {
                for id in &evicted.ids {
                    self.ids.remove(id);
                }
            }
        }
        self.ids.insert(message.id.clone());
        self.recent.push_back(Fingerprint {
            ids: vec![message.id.clone()],
            side: message.sender_role.side(),
            digest: content_digest(message),
            created_at: message.created_at,
        });
    }

    fn alias(&mut self, original_id: &str, alias: &str) {
        if let Some(seen) = self
            .recent
            .iter_mut()
            .find(|seen| seen.ids.iter().any(|id| id == original_id))
        {
            seen.ids.push(alias.to_string());
            self.ids.insert(alias.to_string());
        }
    }

    /// Drops a fingerprint, e.g. when an optimistic send failed validation.
    pub fn forget(&mut self, id: &str) {
        if let Some(pos) = self
            .recent
            .iter()
            .position(|seen| seen.ids.iter().any(|seen_id| seen_id == id))
        {
            if let Some(removed) = self.recent.remove(pos) {
                for id in &removed.ids {
                    self.ids.remove(id);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.recent.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SenderRole;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + ms).unwrap()
    }

    fn msg(id: &str, role: SenderRole, content: &str, ms: i64) -> Message {
        Message {
            id: id.to_string(),
            channel_id: "support_c1".to_string(),
            sender_role: role,
            sender_id: String::new(),
            content: content.to_string(),
            created_at: at(ms),
            recommendation: None,
        }
    }

    #[test]
    fn same_id_twice_is_one_entry() {
        let mut dedup = Deduplicator::default();
        let m = msg("m1", SenderRole::Customer, "Hello", 0);
        assert_eq!(dedup.admit(&m), Verdict::Fresh);
        assert_eq!(dedup.admit(&m), Verdict::DuplicateId);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn echo_inside_window_collapses() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("local_123", SenderRole::Customer, "Hello", 0));
        let echo = msg("srv-9", SenderRole::Customer, "Hello", 2_900);
        assert_eq!(
            dedup.admit(&echo),
            Verdict::DuplicateEcho {
                original_id: "local_123".into()
            }
        );
        // The echo id is now known by identity.
        assert_eq!(dedup.admit(&echo), Verdict::DuplicateId);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn echo_outside_window_is_new() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("local_123", SenderRole::Customer, "Hello", 0));
        let late = msg("srv-9", SenderRole::Customer, "Hello", 3_100);
        assert_eq!(dedup.admit(&late), Verdict::Fresh);
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn window_is_symmetric() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("srv-1", SenderRole::Support, "On it", 5_000));
        assert!(!dedup
            .classify(&msg("local_1", SenderRole::Support, "On it", 2_100))
            .is_fresh());
    }

    #[test]
    fn operators_of_either_topic_count_as_one_side() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("a", SenderRole::Consultant, "Try this", 0));
        assert!(!dedup
            .classify(&msg("b", SenderRole::Support, "Try this", 500))
            .is_fresh());
        // The customer saying the same words is a different message.
        assert!(dedup
            .classify(&msg("c", SenderRole::Customer, "Try this", 500))
            .is_fresh());
    }

    #[test]
    fn different_content_is_never_fuzzy() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("a", SenderRole::Customer, "Hello", 0));
        assert!(dedup
            .classify(&msg("b", SenderRole::Customer, "Hello!", 10))
            .is_fresh());
    }

    #[test]
    fn recommendations_of_different_products_stay_apart() {
        let snapshot = |product_id: &str| crate::types::ProductSnapshot {
            product_id: product_id.into(),
            name: format!("Product {product_id}"),
            price: 10.0,
            image_url: String::new(),
            rating: None,
        };
        let mut dedup = Deduplicator::default();
        let mut first = msg("s1", SenderRole::Consultant, "", 0);
        first.recommendation = Some(snapshot("p1"));
        let mut second = msg("s2", SenderRole::Consultant, "", 800);
        second.recommendation = Some(snapshot("p2"));

        assert_eq!(dedup.admit(&first), Verdict::Fresh);
        assert_eq!(dedup.admit(&second), Verdict::Fresh);

        // The echo of the same recommendation still collapses.
        let mut echo = msg("srv-1", SenderRole::Consultant, "", 1_200);
        echo.recommendation = Some(snapshot("p2"));
        assert!(!dedup.admit(&echo).is_fresh());
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn ring_evicts_oldest_identities() {
        let mut dedup = Deduplicator::new(2, Duration::milliseconds(DEFAULT_FUZZY_WINDOW_MS));
        dedup.admit(&msg("a", SenderRole::Customer, "one", 0));
        dedup.admit(&msg("b", SenderRole::Customer, "two", 10_000));
        dedup.admit(&msg("c", SenderRole::Customer, "three", 20_000));
        assert_eq!(dedup.len(), 2);
        assert_eq!(
            dedup.classify(&msg("a", SenderRole::Customer, "one", 0)),
            Verdict::Fresh
        );
        assert_eq!(
            dedup.classify(&msg("c", SenderRole::Customer, "three", 20_000)),
            Verdict::DuplicateId
        );
    }

    #[test]
    fn forget_releases_id_and_fingerprint() {
        let mut dedup = Deduplicator::default();
        dedup.admit(&msg("local_1", SenderRole::Customer, "Hi", 0));
        dedup.forget("local_1");
        assert!(dedup.is_empty());
        assert!(dedup
            .classify(&msg("local_1", SenderRole::Customer, "Hi", 0))
            .is_fresh());
    }
}
