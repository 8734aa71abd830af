//! # 时间工具
//!
//! 日级限流窗口与任务超时判断使用服务器本地时区

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Utc};

/// 本地日期键，例如 `2024-05-01`
#[must_use]
pub fn local_day_key(now: DateTime<Local>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// 距离下一个本地零点的秒数，至少为 1
#[must_use]
pub fn seconds_until_local_midnight(now: DateTime<Local>) -> u64 {
    next_local_midnight(now).map_or(86_400, |midnight| {
        (midnight - now).num_seconds().max(1) as u64
    })
}

/// 下一个本地零点；夏令时导致时刻不存在时取较早的合法时刻
#[must_use]
pub fn next_local_midnight(now: DateTime<Local>) -> Option<DateTime<Local>> {
    let tomorrow = now.date_naive().succ_opt()?;
    let naive = tomorrow.and_time(NaiveTime::MIN);
    Local.from_local_datetime(&naive).earliest()
}

/// 下一个本地零点的 Unix 时间戳
#[must_use]
pub fn next_local_midnight_timestamp(now: DateTime<Local>) -> i64 {
    next_local_midnight(now).map_or_else(
        || (now + ChronoDuration::days(1)).timestamp(),
        |m| m.timestamp(),
    )
}

/// 当前 UTC 时间戳（秒）
#[must_use]
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// 按 `YYYY_MM` 生成月度分区键
#[must_use]
pub fn month_partition(ts: DateTime<Utc>) -> String {
    ts.format("%Y_%m").to_string()
}
