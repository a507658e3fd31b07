//! Order-independent identity of a conversation's participant set.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use shared::domain::UserId;

/// A de-duplicated, sorted set of participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantSet(BTreeSet<UserId>);

impl ParticipantSet {
    pub fn new(requesting_user: UserId, others: impl IntoIterator<Item = UserId>) -> Self {
        let mut members: BTreeSet<UserId> = others.into_iter().collect();
        members.insert(requesting_user);
        Self(members)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.0.contains(&user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = UserId> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<UserId> {
        self.iter().collect()
    }

    pub fn key(&self) -> String {
        participant_set_key(self.iter())
    }
}

impl FromIterator<UserId> for ParticipantSet {
    fn from_iter<I: IntoIterator<Item = UserId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// SHA-256 over the sorted, comma-joined user ids, base64url encoded.
pub fn participant_set_key(user_ids: impl IntoIterator<Item = UserId>) -> String {
    let sorted: BTreeSet<UserId> = user_ids.into_iter().collect();
    let canonical = sorted
        .iter()
        .map(|id| id.0.to_string())
        .collect::<Vec<_>>()
        .join(",");
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_order_and_duplicates() {
        let a = participant_set_key([UserId(3), UserId(1), UserId(2)]);
        let b = participant_set_key([UserId(1), UserId(2), UserId(3), UserId(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn key_distinguishes_sets() {
        let pair = participant_set_key([UserId(1), UserId(2)]);
        let trio = participant_set_key([UserId(1), UserId(2), UserId(3)]);
        assert_ne!(pair, trio);
        // "1,23" and "12,3" must not collide through naive concatenation.
        assert_ne!(
            participant_set_key([UserId(1), UserId(23)]),
            participant_set_key([UserId(12), UserId(3)])
        );
    }

    #[test]
    fn set_includes_requesting_user_once() {
        let set = ParticipantSet::new(UserId(7), [UserId(7), UserId(9)]);
        assert_eq!(set.to_vec(), vec![UserId(7), UserId(9)]);
        assert_eq!(set.key(), participant_set_key([UserId(9), UserId(7)]));
    }
}
