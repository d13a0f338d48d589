//! Write-position arithmetic.
//!
//! A [`Position`] tracks where the next batch lands: how many bytes the
//! current part has accumulated, the running part index, and the time
//! partition. [`advance`] computes the next position for a payload and the
//! [`Action`]s that the transition requires, which the flush stage enqueues
//! around the payload itself.
use crate::error::{Error, Result};
use crate::store::PartLimits;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Where the next payload lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Bytes already accumulated in the current part.
    pub bytes: u64,
    /// Part index, increasing over the lifetime of a directory.
    pub part: u64,
    /// Current time-partition directory.
    pub dir: String,
}

impl Position {
    pub fn new<D: Into<String>>(bytes: u64, part: u64, dir: D) -> Self {
        Self {
            bytes,
            part,
            dir: dir.into(),
        }
    }

    /// Which object of the directory this position writes to.
    pub fn file_number(&self, limits: &PartLimits) -> u64 {
        self.part / limits.max_parts
    }

    /// 1-based part number within the object, as the store counts parts.
    pub fn part_number(&self, limits: &PartLimits) -> i32 {
        (self.part % limits.max_parts) as i32 + 1
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.dir, self.part, self.bytes)
    }
}

/// Identifies the object a position belongs to in the consumer's state map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Part index of the object's first part.
    pub first_part: u64,
    pub dir: String,
}

impl ObjectKey {
    pub fn of(pos: &Position, limits: &PartLimits) -> Self {
        Self {
            first_part: pos.file_number(limits) * limits.max_parts,
            dir: pos.dir.clone(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dir, self.first_part)
    }
}

/// One unit of work for the upload loop, carried through the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Initiate the multipart upload for the object implied by the position.
    Start(Position),
    /// Stage a payload for the position's part. The task itself is the unit
    /// of acknowledgment: it is completed when its part uploads.
    Append {
        pos: Position,
        /// Records contained in the payload.
        count: u64,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Flush the staged payloads of the position's part to the store.
    Upload(Position),
    /// Complete (or abort, when nothing was uploaded) the position's object.
    End(Position),
    /// Close every open object.
    Flush,
    /// Placeholder for a corrupted task.
    Skip,
}

impl Action {
    pub fn encode(&self) -> Result<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(Error::encoding)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Error::corrupt_task)
    }
}

/// The outcome of advancing a position over one payload.
///
/// `before` is enqueued ahead of the payload's [`Action::Append`], `after`
/// behind it. The split is what guarantees the consumer sees a `Start`
/// before any reference to a new object and stages an `Append` before the
/// `Upload` that flushes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    pub position: Position,
    pub before: Vec<Action>,
    pub after: Vec<Action>,
}

/// Compute the position transition for a payload of `len` bytes arriving
/// while the clock maps to `dir_now`.
pub fn advance(p: &Position, dir_now: &str, len: u64, limits: &PartLimits) -> Advance {
    if p.dir != dir_now {
        // New time partition: the old object ends and a fresh one begins at
        // part 0 of the new directory. A payload already past the minimum
        // closes that first part immediately, as it would mid-partition.
        let next = Position::new(len, 0, dir_now);
        let after = if len > limits.min_part_size {
            vec![Action::Upload(next.clone())]
        } else {
            Vec::new()
        };
        return Advance {
            before: vec![Action::End(p.clone()), Action::Start(next.clone())],
            after,
            position: next,
        };
    }

    let (part, bytes) = if p.bytes > limits.min_part_size {
        (p.part + 1, len)
    } else {
        (p.part, p.bytes + len)
    };
    let next = Position::new(bytes, part, dir_now);

    let mut before = Vec::new();
    let mut after = Vec::new();
    if part != p.part && part % limits.max_parts == 0 {
        before.push(Action::Start(next.clone()));
        after.push(Action::End(p.clone()));
    }
    if bytes > limits.min_part_size {
        after.push(Action::Upload(next.clone()));
    }

    Advance {
        position: next,
        before,
        after,
    }
}

/// Format the store key for one object.
///
/// Grammar: `<dir>/<id>-<file_number, zero-padded to 6>.journal[.<suffix>]`.
pub fn object_key(dir: &str, id: &str, file_number: u64, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{dir}/{id}-{file_number:06}.journal.{s}"),
        None => format!("{dir}/{id}-{file_number:06}.journal"),
    }
}

/// The components recovered from an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub dir: &'a str,
    pub id: &'a str,
    pub file_number: u64,
}

/// Reverse-parse a key produced by [`object_key`].
///
/// Returns `None` for keys that do not follow the grammar, which is how
/// recovery and the sweeper skip foreign objects in a shared bucket.
pub fn parse_object_key(key: &str) -> Option<ParsedKey<'_>> {
    let stem_end = key.rfind(".journal")?;
    let rest = &key[stem_end + ".journal".len()..];
    if !rest.is_empty() && !rest.starts_with('.') {
        return None;
    }
    let head = &key[..stem_end];
    let dash = head.rfind('-')?;
    let digits = &head[dash + 1..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let file_number = digits.parse().ok()?;
    let slash = head[..dash].rfind('/')?;
    Some(ParsedKey {
        dir: &key[..slash],
        id: &head[slash + 1..dash],
        file_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limits() -> PartLimits {
        PartLimits {
            min_part_size: 16,
            max_part_size: 1 << 20,
            max_parts: 4,
        }
    }

    #[test]
    fn small_payloads_accumulate_in_one_part() {
        let p = Position::new(0, 0, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 6, &limits());
        assert_eq!(adv.position, Position::new(6, 0, "2024/01/15"));
        assert!(adv.before.is_empty());
        assert!(adv.after.is_empty());
    }

    #[test]
    fn crossing_the_minimum_emits_an_upload() {
        let p = Position::new(10, 0, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 10, &limits());
        assert_eq!(adv.position.bytes, 20);
        assert_eq!(adv.position.part, 0);
        assert_eq!(adv.after, vec![Action::Upload(adv.position.clone())]);
    }

    #[test]
    fn a_flushed_part_is_left_behind_by_the_next_payload() {
        let p = Position::new(20, 0, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 6, &limits());
        assert_eq!(adv.position, Position::new(6, 1, "2024/01/15"));
        assert!(adv.before.is_empty());
        assert!(adv.after.is_empty());
    }

    #[test]
    fn object_rollover_starts_before_and_ends_after() {
        // Part 3 is the last slot with max_parts = 4; advancing off it rolls
        // over to a new object at part 4.
        let p = Position::new(20, 3, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 6, &limits());
        assert_eq!(adv.position, Position::new(6, 4, "2024/01/15"));
        assert_eq!(adv.before, vec![Action::Start(adv.position.clone())]);
        assert_eq!(adv.after, vec![Action::End(p)]);
    }

    #[test]
    fn rollover_with_a_large_payload_also_uploads() {
        let p = Position::new(20, 3, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 30, &limits());
        assert_eq!(adv.position.part, 4);
        assert_eq!(adv.before, vec![Action::Start(adv.position.clone())]);
        assert_eq!(
            adv.after,
            vec![Action::End(p), Action::Upload(adv.position.clone())]
        );
    }

    #[test]
    fn directory_change_ends_then_starts_ahead_of_the_payload() {
        let p = Position::new(9, 2, "2024/01/15");
        let adv = advance(&p, "2024/01/16", 6, &limits());
        assert_eq!(adv.position, Position::new(6, 0, "2024/01/16"));
        assert_eq!(
            adv.before,
            vec![Action::End(p), Action::Start(adv.position.clone())]
        );
        assert!(adv.after.is_empty());
    }

    #[test]
    fn directory_change_with_a_large_payload_also_uploads() {
        let p = Position::new(9, 2, "2024/01/15");
        let adv = advance(&p, "2024/01/16", 30, &limits());
        assert_eq!(adv.position, Position::new(30, 0, "2024/01/16"));
        assert_eq!(
            adv.before,
            vec![Action::End(p), Action::Start(adv.position.clone())]
        );
        assert_eq!(adv.after, vec![Action::Upload(adv.position.clone())]);
    }

    #[test]
    fn zero_length_payload_can_still_rotate_the_part() {
        let p = Position::new(20, 1, "2024/01/15");
        let adv = advance(&p, "2024/01/15", 0, &limits());
        assert_eq!(adv.position, Position::new(0, 2, "2024/01/15"));
        assert!(adv.after.is_empty());
    }

    #[test]
    fn derived_object_coordinates() {
        let l = limits();
        let p = Position::new(0, 6, "d");
        assert_eq!(p.file_number(&l), 1);
        assert_eq!(p.part_number(&l), 3);
        assert_eq!(ObjectKey::of(&p, &l).first_part, 4);
    }

    #[test]
    fn action_codec_round_trips() {
        let actions = [
            Action::Start(Position::new(0, 4, "2024/01/15")),
            Action::Append {
                pos: Position::new(6, 4, "2024/01/15"),
                count: 3,
                payload: b"hello\n".to_vec(),
            },
            Action::Upload(Position::new(20, 4, "2024/01/15")),
            Action::End(Position::new(0, 4, "2024/01/15")),
            Action::Flush,
            Action::Skip,
        ];
        for action in actions {
            let bytes = action.encode().unwrap();
            assert_eq!(Action::decode(&bytes).unwrap(), action);
        }
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Action::decode(b"\xff\xff\xff\xff garbage").is_err());
    }

    #[test]
    fn keys_format_and_parse() {
        let key = object_key("2024/01/15", "host-a", 7, Some("gz"));
        assert_eq!(key, "2024/01/15/host-a-000007.journal.gz");
        let parsed = parse_object_key(&key).unwrap();
        assert_eq!(parsed.dir, "2024/01/15");
        assert_eq!(parsed.id, "host-a");
        assert_eq!(parsed.file_number, 7);

        assert!(parse_object_key("2024/01/15/unrelated.csv").is_none());
        assert!(parse_object_key("no-directory-000001.journal").is_none());
        assert!(parse_object_key("d/x-abc.journal").is_none());
    }

    proptest! {
        #[test]
        fn advance_respects_part_geometry(sizes in prop::collection::vec(0u64..40, 1..80)) {
            let l = limits();
            let mut pos = Position::new(0, 0, "2024/01/15");
            for s in sizes {
                let adv = advance(&pos, "2024/01/15", s, &l);
                // Part index never moves backwards and never skips.
                prop_assert!(adv.position.part == pos.part || adv.position.part == pos.part + 1);
                // An upload is emitted exactly when the new part exceeds the minimum.
                let uploads = adv.after.iter().filter(|a| matches!(a, Action::Upload(_))).count();
                prop_assert_eq!(uploads, usize::from(adv.position.bytes > l.min_part_size));
                // A fresh object always announces itself.
                if adv.position.part != pos.part && adv.position.part % l.max_parts == 0 {
                    prop_assert!(matches!(adv.before[0], Action::Start(_)));
                }
                pos = adv.position;
            }
        }

        #[test]
        fn key_round_trip_preserves_object_coordinates(part in 0u64..100_000, file_dir in "[a-z]{1,8}/[0-9]{4}") {
            let l = limits();
            let pos = Position::new(0, part, file_dir.clone());
            let key = object_key(&pos.dir, "node-1", pos.file_number(&l), None);
            let parsed = parse_object_key(&key).unwrap();
            prop_assert_eq!(parsed.dir, file_dir.as_str());
            prop_assert_eq!(parsed.file_number, part / l.max_parts);
        }
    }
}
