use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 存储层：只按访问延迟/成本区分，数据模型一致。
///
/// 声明顺序即“由热到冷”，派生的 `Ord` 依赖这一点。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl Tier {
    /// 回退探测的固定顺序：热 -> 温 -> 冷（不允许按年龄跳层）
    pub const PROBE_ORDER: [Tier; 3] = [Tier::Hot, Tier::Warm, Tier::Cold];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
        }
    }

    pub fn is_colder_than(self, other: Tier) -> bool {
        self > other
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier `{0}` (expected hot, warm or cold)")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_runs_hot_to_cold() {
        assert!(Tier::Cold.is_colder_than(Tier::Warm));
        assert!(Tier::Warm.is_colder_than(Tier::Hot));
        assert!(!Tier::Hot.is_colder_than(Tier::Hot));
        assert_eq!(Tier::PROBE_ORDER.map(Tier::index), [0, 1, 2]);
    }

    #[test]
    fn parse_is_case_insensitive_and_rejects_unknown() {
        assert_eq!(" WARM ".parse::<Tier>().unwrap(), Tier::Warm);
        assert_eq!(
            "archive".parse::<Tier>().unwrap_err(),
            UnknownTier("archive".into())
        );
    }
}
