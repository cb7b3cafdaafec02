use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 用户通知偏好 / User notification preferences
///
/// 缺省值全部放行：开启应用内与推送通知、无静音类型、免打扰关闭
/// Defaults are permissive: in-app and push enabled, nothing muted, quiet hours off
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPrefs {
    #[serde(default = "default_enabled")]
    pub in_app_notifications: bool,

    #[serde(default = "default_enabled")]
    pub push_notifications: bool,

    /// 静音的通知类型 / Muted notification types
    #[serde(default)]
    pub muted_types: HashSet<String>,

    /// 免打扰时段 / Quiet hours window
    #[serde(default)]
    pub quiet_hours: QuietHours,
}

fn default_enabled() -> bool {
    true
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            in_app_notifications: true,
            push_notifications: true,
            muted_types: HashSet::new(),
            quiet_hours: QuietHours::default(),
        }
    }
}

/// 免打扰时段，"HH:MM" 字符串，按服务器本地时钟判定
/// Quiet hours window, "HH:MM" strings, judged on the server-local clock
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub end: String,
}
