//! 偏好过滤 / Preference filter
//!
//! 纯函数：决定某条通知此刻是否投递给用户。免打扰时段按服务器本地时钟
//! 的日内分钟判定，闭区间 `[start, end]`；`start > end` 的跨零点写法不在
//! 支持范围内，区间为空、不拦任何通知。
//! Pure functions deciding whether a notification is delivered to a user at
//! a given instant. Quiet hours compare the server-local minute of day
//! against the closed interval `[start, end]`; `start > end` wrap-around
//! windows are unsupported, the interval is empty and suppresses nothing.

use chrono::{Local, Timelike};

use crate::domain::{NotificationPayload, NotificationPrefs};

/// 按当前本地时间判定 / Decide using the current local time
pub fn should_deliver(payload: &NotificationPayload, prefs: &NotificationPrefs) -> bool {
    let now = Local::now();
    should_deliver_at(&payload.kind, prefs, now.hour() * 60 + now.minute())
}

/// 核心判定 / Core decision
///
/// 返回 false 当且仅当：站内通知总开关关闭，或类型被静音，或处于
/// 免打扰时段。
/// Returns false iff in-app notifications are off, the type is muted, or
/// the minute falls inside an active quiet-hours window.
pub fn should_deliver_at(kind: &str, prefs: &NotificationPrefs, minute_of_day: u32) -> bool {
    if !prefs.in_app_notifications {
        return false;
    }
    if prefs.muted_types.contains(kind) {
        return false;
    }
    if prefs.quiet_hours.enabled {
        if let (Some(start), Some(end)) = (
            parse_hhmm(&prefs.quiet_hours.start),
            parse_hhmm(&prefs.quiet_hours.end),
        ) {
            if start <= minute_of_day && minute_of_day <= end {
                return false;
            }
        }
        // 时间串无法解析时窗口失效 / An unparsable bound deactivates the window
    }
    true
}

/// "HH:MM" 转日内分钟 / "HH:MM" to minute of day
fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let minutes: u32 = minutes.trim().parse().ok()?;
    if hours < 24 && minutes < 60 {
        Some(hours * 60 + minutes)
    } else {
        None
    }
}
