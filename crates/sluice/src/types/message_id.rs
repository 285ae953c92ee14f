use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;
use crate::types::ShardNumber;

/// Address of one message row.
///
/// The local id is unique and increasing within its shard only; the pair is
/// unique across the whole queue. There is no global ordering across shards.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageId {
    pub local_id: i64,
    pub shard: ShardNumber,
}

impl MessageId {
    pub fn new(local_id: i64, shard: ShardNumber) -> Self {
        Self { local_id, shard }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.local_id, self.shard)
    }
}

/// Parses the `local_id/shard` form produced by `Display`.
impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QueueError::MalformedId {
            input: s.to_string(),
        };
        let (local, shard) = s.split_once('/').ok_or_else(malformed)?;
        let local_id: i64 = local.parse().map_err(|_| malformed())?;
        let shard: i32 = shard.parse().map_err(|_| malformed())?;
        let shard = ShardNumber::new(shard).map_err(|_| malformed())?;
        Ok(Self { local_id, shard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse() {
        let id = MessageId::new(9_007_199_254_740_993, ShardNumber::new_unchecked(17));
        assert_eq!(id.to_string(), "9007199254740993/17");
        assert_eq!("9007199254740993/17".parse::<MessageId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        for input in ["", "12", "12/", "/3", "a/1", "1/b", "1/2/3", "5/0", "5/-2"] {
            assert!(input.parse::<MessageId>().is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn parse_reports_the_input_for_bad_shards() {
        match "5/0".parse::<MessageId>() {
            Err(QueueError::MalformedId { input }) => assert_eq!(input, "5/0"),
            other => panic!("expected MalformedId, got {other:?}"),
        }
    }
}
