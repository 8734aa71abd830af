//! # 按模型映射消息角色
//!
//! 映射表 `{模型前缀 → {源角色 → 目标角色}}`，最长前缀生效。

use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::LazyLock;

use super::openai::types::ChatMessage;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

const KNOWN_ROLES: &[&str] = &["system", "developer", "user", "assistant", "tool", "function"];

/// 已告警过的未知角色；角色名来自客户端，记满后不再告警
static WARNED_ROLES: LazyLock<DashSet<String>> = LazyLock::new(DashSet::new);
const MAX_WARNED_ROLES: usize = 256;

/// 角色首次出现且记录未满时返回 true
fn first_sighting(seen: &DashSet<String>, role: &str) -> bool {
    if seen.len() >= MAX_WARNED_ROLES || seen.contains(role) {
        return false;
    }
    seen.insert(role.to_string())
}

/// 模型命中的映射；键可以带 `*` 结尾
#[must_use]
pub fn mapping_for<'a>(
    table: &'a HashMap<String, HashMap<String, String>>,
    model: &str,
) -> Option<&'a HashMap<String, String>> {
    table
        .iter()
        .filter_map(|(prefix, mapping)| {
            let prefix = prefix.trim_end_matches('*');
            model.starts_with(prefix).then_some((prefix.len(), mapping))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, mapping)| mapping)
}

/// 沿映射链解析到不再被映射的角色；存在环时保持原角色
#[must_use]
pub fn map_role(mapping: &HashMap<String, String>, role: &str) -> String {
    let mut current = role;
    for _ in 0..=mapping.len() {
        match mapping.get(current) {
            Some(next) if next != current => current = next.as_str(),
            _ => return current.to_string(),
        }
    }
    role.to_string()
}

/// 就地改写消息角色
pub fn apply_role_mapping(
    table: &HashMap<String, HashMap<String, String>>,
    model: &str,
    messages: &mut [ChatMessage],
) {
    let mapping = mapping_for(table, model);
    for message in messages {
        if let Some(mapping) = mapping {
            message.role = map_role(mapping, &message.role);
        }
        if !KNOWN_ROLES.contains(&message.role.as_str()) && first_sighting(&WARNED_ROLES, &message.role) {
            lwarn!(
                "system",
                LogStage::RequestModify,
                LogComponent::Adaptor,
                "unknown_role",
                "未知消息角色，按原样透传",
                role = %message.role,
                model = %model
            );
        }
    }
}
