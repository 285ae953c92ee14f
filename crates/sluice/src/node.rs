use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{Bucket, ServerId};

/// Characters used for generated server ids.
///
/// Excludes characters that are easy to confuse when read by a human:
/// `l`, `I`, `O`, `0` and `1`.
pub const SERVER_ID_ALPHABET: &[u8] = b"abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Constant primary key of the node singleton row.
pub const NODE_STATUS_ACTIVE: &str = "active";

/// Generate a random server id of `len` characters from [`SERVER_ID_ALPHABET`].
pub fn generate_server_id<R: Rng + ?Sized>(rng: &mut R, len: usize) -> ServerId {
    let id: String = (0..len)
        .map(|_| SERVER_ID_ALPHABET[rng.gen_range(0..SERVER_ID_ALPHABET.len())] as char)
        .collect();
    ServerId(id)
}

/// Identity of one physical database node, as stored in its singleton row.
///
/// Written once by whichever process boots first against the node; every
/// later process reads the same row back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub server_id: ServerId,
    /// Slice of the id space owned by this node. `None` until the cluster
    /// topology assigns one.
    pub identifiers_bucket: Option<Bucket>,
    pub created_at: DateTime<Utc>,
}
