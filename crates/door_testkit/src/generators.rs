//! Property-based test generators using proptest.

use crate::fixtures::DiscussionPost;
use proptest::prelude::*;

/// Strategy for a single post with a uid in `uids` and a positive version.
pub fn post_strategy(uids: std::ops::Range<i64>) -> impl Strategy<Value = DiscussionPost> {
    (
        uids,
        0i64..100,
        prop::option::of("[a-zA-Z ]{0,24}"),
        prop::option::of("[a-zA-Z0-9 .,]{0,64}"),
        1i64..1_000_000,
        1i64..50,
    )
        .prop_map(|(uid, reply_to, title, text, version, member)| DiscussionPost {
            post_uid: uid,
            post_reply_to_post_uid: reply_to,
            post_title: title,
            post_text: text,
            post_last_modified: version,
            poster_member_uid: member,
        })
}

/// Strategy for a sequence of writes that revisits a small set of uids, so
/// that the same post is written several times with unrelated versions.
pub fn post_write_sequence_strategy(
    max_len: usize,
) -> impl Strategy<Value = Vec<DiscussionPost>> {
    prop::collection::vec(post_strategy(1..8), 1..max_len.max(2))
}

/// The post each uid should hold after applying `writes` with
/// last-writer-wins: the first write carrying the highest version.
pub fn last_writer_wins(writes: &[DiscussionPost]) -> Vec<DiscussionPost> {
    let mut winners: Vec<DiscussionPost> = Vec::new();
    for write in writes {
        match winners.iter_mut().find(|w| w.post_uid == write.post_uid) {
            Some(current) if write.post_last_modified > current.post_last_modified => {
                *current = write.clone();
            }
            Some(_) => {}
            None => winners.push(write.clone()),
        }
    }
    winners.sort_by_key(|post| post.post_uid);
    winners
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Number of test cases to generate.
    pub cases: u32,
    /// Maximum number of shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropertyTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 200,
        }
    }
}

impl PropertyTestConfig {
    /// Few cases, for tests that open databases per case.
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 50,
        }
    }

    /// Converts to proptest configuration.
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_highest_version_wins() {
        let writes = vec![
            DiscussionPost::new(1, 5).with_text("a"),
            DiscussionPost::new(1, 9).with_text("b"),
            DiscussionPost::new(1, 9).with_text("c"),
            DiscussionPost::new(2, 1),
            DiscussionPost::new(1, 3),
        ];
        let winners = last_writer_wins(&writes);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0].post_text.as_deref(), Some("b"));
        assert_eq!(winners[1].post_uid, 2);
    }

    proptest! {
        #[test]
        fn winners_are_unique_and_maximal(writes in post_write_sequence_strategy(30)) {
            let winners = last_writer_wins(&writes);
            for winner in &winners {
                let max = writes
                    .iter()
                    .filter(|w| w.post_uid == winner.post_uid)
                    .map(|w| w.post_last_modified)
                    .max();
                prop_assert_eq!(Some(winner.post_last_modified), max);
            }
            let mut uids: Vec<i64> = winners.iter().map(|w| w.post_uid).collect();
            uids.dedup();
            prop_assert_eq!(uids.len(), winners.len());
        }
    }
}
