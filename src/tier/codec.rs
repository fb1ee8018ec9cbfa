use serde::{Deserialize, Serialize};

use super::TierError;
use crate::core::Record;

/// 层上的记录编码。热层用 bincode（紧凑），温/冷层用 JSON（可直接检视）。
/// 两种编码都必须无损往返：迁移校验比较的是 `Record::checksum`。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Bincode,
    Json,
}

impl Codec {
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Bincode => "bin",
            Codec::Json => "json",
        }
    }

    pub fn encode(self, record: &Record) -> Result<Vec<u8>, TierError> {
        match self {
            Codec::Bincode => {
                bincode::serialize(record).map_err(|e| TierError::Codec(e.to_string()))
            }
            Codec::Json => {
                serde_json::to_vec(record).map_err(|e| TierError::Codec(e.to_string()))
            }
        }
    }

    pub fn decode(self, bytes: &[u8]) -> Result<Record, TierError> {
        match self {
            Codec::Bincode => {
                bincode::deserialize(bytes).map_err(|e| TierError::Codec(e.to_string()))
            }
            Codec::Json => {
                serde_json::from_slice(bytes).map_err(|e| TierError::Codec(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn reencoding_hot_record_for_cold_tier_is_lossless() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 5).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let mut record = Record::new("R-77", vec![0, 255, b'{', b'}', 10], created);
        record.modified_at = created + chrono::Duration::seconds(3);

        let hot = Codec::Bincode.encode(&record).unwrap();
        let from_hot = Codec::Bincode.decode(&hot).unwrap();
        let cold = Codec::Json.encode(&from_hot).unwrap();
        let from_cold = Codec::Json.decode(&cold).unwrap();

        assert_eq!(from_cold, record);
        assert_eq!(from_cold.checksum(), record.checksum());
    }

    #[test]
    fn garbage_is_a_codec_error() {
        let err = Codec::Json.decode(b"not json").unwrap_err();
        assert!(matches!(err, TierError::Codec(_)));
        assert!(!err.is_transient());
    }
}
