use serde::{Deserialize, Serialize};

/// Viewports narrower than this count as mobile.
pub const MOBILE_BREAKPOINT_PX: u32 = 768;

/// Raw environment facts supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    pub user_agent: String,
    pub platform: String,
    pub locale: String,
    pub viewport_width: u32,
}

/// Coarse device fingerprint sent with every delegated login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub user_agent: String,
    pub platform: String,
    pub locale: String,
    pub is_mobile: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            user_agent: "unknown".into(),
            platform: "unknown".into(),
            locale: "en".into(),
            is_mobile: false,
        }
    }
}

impl From<&DeviceContext> for DeviceInfo {
    fn from(ctx: &DeviceContext) -> Self {
        let fallback = Self::default();
        let or_fallback = |value: &str, fallback: String| {
            if value.trim().is_empty() {
                fallback
            } else {
                value.to_string()
            }
        };
        Self {
            user_agent: or_fallback(&ctx.user_agent, fallback.user_agent),
            platform: or_fallback(&ctx.platform, fallback.platform),
            locale: or_fallback(&ctx.locale, fallback.locale),
            is_mobile: ctx.viewport_width > 0 && ctx.viewport_width < MOBILE_BREAKPOINT_PX,
        }
    }
}
