//! 上游任务状态归一

use std::collections::HashMap;

use crate::store::TaskStatus;

/// 默认状态映射，键为小写的上游状态
const DEFAULT_MAPPING: &[(&str, TaskStatus)] = &[
    ("submitted", TaskStatus::Submitted),
    ("not_start", TaskStatus::Submitted),
    ("created", TaskStatus::Submitted),
    ("queued", TaskStatus::Queued),
    ("pending", TaskStatus::Queued),
    ("waiting", TaskStatus::Queued),
    ("in_progress", TaskStatus::InProgress),
    ("processing", TaskStatus::InProgress),
    ("running", TaskStatus::InProgress),
    ("generating", TaskStatus::InProgress),
    ("success", TaskStatus::Success),
    ("succeed", TaskStatus::Success),
    ("succeeded", TaskStatus::Success),
    ("completed", TaskStatus::Success),
    ("complete", TaskStatus::Success),
    ("finished", TaskStatus::Success),
    ("failure", TaskStatus::Failure),
    ("failed", TaskStatus::Failure),
    ("fail", TaskStatus::Failure),
    ("error", TaskStatus::Failure),
    ("cancelled", TaskStatus::Failure),
    ("canceled", TaskStatus::Failure),
];

/// 状态映射表：运行时配置覆盖默认表
#[derive(Debug, Clone)]
pub struct StatusMapper {
    table: HashMap<String, TaskStatus>,
}

impl Default for StatusMapper {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

impl StatusMapper {
    /// 配置值无法解析的条目被忽略
    #[must_use]
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut table: HashMap<String, TaskStatus> = DEFAULT_MAPPING
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        for (upstream, canonical) in overrides {
            if let Some(status) = TaskStatus::parse(&canonical.to_ascii_lowercase()) {
                table.insert(upstream.to_ascii_lowercase(), status);
            }
        }
        Self { table }
    }

    /// 未知状态返回 `None`
    #[must_use]
    pub fn map(&self, upstream: &str) -> Option<TaskStatus> {
        self.table.get(&upstream.trim().to_ascii_lowercase()).copied()
    }
}
