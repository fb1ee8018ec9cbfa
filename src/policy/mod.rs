use std::path::Path;

use serde::{Deserialize, Serialize};

/// 存储平台自带的生命周期规则动作（本 crate 只读，不执行）
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    TierToCool,
    TierToCold,
    TierToArchive,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub prefix_match: Vec<String>,
    pub days_after_modification: u32,
    pub action: LifecycleAction,
}

fn default_enabled() -> bool {
    true
}

/// 平台管理策略原始格式：
/// `{"name", "enabled", "definition": {"filters": {"prefixMatch"}, "actions": {"baseBlob": {...}}}}`
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformRule {
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    definition: PlatformDefinition,
}

#[derive(Deserialize)]
struct PlatformDefinition {
    filters: PlatformFilters,
    actions: PlatformActions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformFilters {
    #[serde(default)]
    prefix_match: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformActions {
    base_blob: std::collections::BTreeMap<String, PlatformCondition>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformCondition {
    days_after_modification_greater_than: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnyRule {
    Flat(LifecycleRule),
    Platform(PlatformRule),
}

#[derive(Deserialize)]
struct RawPolicy {
    #[serde(default)]
    rules: Vec<AnyRule>,
}

impl PlatformRule {
    fn flatten(self) -> anyhow::Result<Vec<LifecycleRule>> {
        let mut out = Vec::new();
        for (action, cond) in self.definition.actions.base_blob {
            let action = match action.as_str() {
                "tierToCool" => LifecycleAction::TierToCool,
                "tierToCold" => LifecycleAction::TierToCold,
                "tierToArchive" => LifecycleAction::TierToArchive,
                "delete" => LifecycleAction::Delete,
                other => anyhow::bail!("rule {}: unknown lifecycle action {}", self.name, other),
            };
            out.push(LifecycleRule {
                name: self.name.clone(),
                enabled: self.enabled,
                prefix_match: self.definition.filters.prefix_match.clone(),
                days_after_modification: cond.days_after_modification_greater_than,
                action,
            });
        }
        Ok(out)
    }
}

/// 外部生命周期策略：平台按修改时间自行搬迁的前缀。
///
/// 调度器不能让自己管理的 key 落进这些前缀，否则两套机制会抢同一批对象。
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LifecyclePolicy {
    pub rules: Vec<LifecycleRule>,
}

impl LifecyclePolicy {
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let parsed: RawPolicy = serde_json::from_str(raw)?;
        let mut rules = Vec::new();
        for rule in parsed.rules {
            match rule {
                AnyRule::Flat(r) => rules.push(r),
                AnyRule::Platform(p) => rules.extend(p.flatten()?),
            }
        }
        Ok(Self { rules })
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let policy = Self::from_json(&raw)?;
        tracing::info!(
            "Loaded lifecycle policy from {:?}: {} rule(s), {} enabled",
            path,
            policy.rules.len(),
            policy.rules.iter().filter(|r| r.enabled).count()
        );
        Ok(policy)
    }

    /// 与 `prefix` 重叠的第一条启用规则（任一方是另一方的前缀即算重叠）
    pub fn owner_of(&self, prefix: &str) -> Option<(&LifecycleRule, &str)> {
        self.rules.iter().filter(|r| r.enabled).find_map(|r| {
            r.prefix_match
                .iter()
                .find(|p| prefix.starts_with(p.as_str()) || p.starts_with(prefix))
                .map(|p| (r, p.as_str()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_rules_parse_with_enabled_default() {
        let p = LifecyclePolicy::from_json(
            r#"{"rules":[{"name":"archive","prefix_match":["billing-archive/"],
                "days_after_modification":90,"action":"tier_to_archive"}]}"#,
        )
        .unwrap();
        assert_eq!(p.rules.len(), 1);
        assert!(p.rules[0].enabled);
        assert_eq!(p.rules[0].action, LifecycleAction::TierToArchive);
    }

    #[test]
    fn platform_management_policy_is_flattened() {
        let p = LifecyclePolicy::from_json(
            r#"{"rules":[{"name":"MoveHotToColdAfter90Days","enabled":true,"type":"Lifecycle",
                "definition":{"filters":{"blobTypes":["blockBlob"],"prefixMatch":["billing-hot/"]},
                "actions":{"baseBlob":{"tierToCool":{"daysAfterModificationGreaterThan":90}}}}}]}"#,
        )
        .unwrap();
        assert_eq!(p.rules[0].prefix_match, vec!["billing-hot/".to_string()]);
        assert_eq!(p.rules[0].days_after_modification, 90);
        assert_eq!(p.rules[0].action, LifecycleAction::TierToCool);
    }

    #[test]
    fn overlap_is_detected_both_ways_and_disabled_rules_ignored() {
        let p = LifecyclePolicy {
            rules: vec![
                LifecycleRule {
                    name: "a".into(),
                    enabled: true,
                    prefix_match: vec!["billing-hot/".into()],
                    days_after_modification: 90,
                    action: LifecycleAction::TierToCool,
                },
                LifecycleRule {
                    name: "off".into(),
                    enabled: false,
                    prefix_match: vec!["warm/".into()],
                    days_after_modification: 30,
                    action: LifecycleAction::Delete,
                },
            ],
        };
        assert!(p.owner_of("billing-hot/").is_some());
        assert!(p.owner_of("billing-hot/2026/").is_some());
        assert!(p.owner_of("billing-").is_some());
        assert!(p.owner_of("hot/").is_none());
        assert!(p.owner_of("warm/").is_none());
    }
}
