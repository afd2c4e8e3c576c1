use serde::{Deserialize, Serialize};

use super::notification::Channel;

/// Remaining send allowance for one `(biz_id, channel)` pair. The hot
/// counter lives in the quota cache; this row is the durable view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub biz_id: i64,
    pub channel: Channel,
    pub quota: i32,
}
