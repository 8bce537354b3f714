//! Display labels derived from a client's User-Agent
//!
//! Best effort only: labels are never used for identity.

use crate::protocol::{PeerId, PeerInfo};

/// Device properties recognised in a User-Agent string
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device model (`iPhone`, `Pixel 7`, ...)
    pub model: Option<String>,
    /// Operating system
    pub os: Option<String>,
    /// Browser or native client
    pub browser: Option<String>,
    /// `mobile` or `tablet`
    pub device_type: Option<String>,
}

impl DeviceInfo {
    /// Classify a User-Agent header value
    pub fn from_user_agent(user_agent: &str) -> Self {
        DeviceInfo {
            model: detect_model(user_agent),
            os: detect_os(user_agent).map(str::to_string),
            browser: detect_browser(user_agent).map(str::to_string),
            device_type: detect_type(user_agent).map(str::to_string),
        }
    }

    /// Human readable label such as `Mac Safari` or `Android Pixel 7`
    pub fn device_name(&self) -> String {
        let os = self.os.as_deref().map(|os| os.replace("Mac OS", "Mac"));
        let detail = self.model.as_deref().or(self.browser.as_deref());

        let name = [os.as_deref(), detail]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if name.is_empty() {
            "Unknown Device".to_string()
        } else {
            name
        }
    }

    /// Public info for a peer with this device
    pub fn into_peer_info(self, peer_id: PeerId) -> PeerInfo {
        let device_name = self.device_name();
        let display_name = peer_id.short().to_string();
        PeerInfo {
            display_name: if display_name.is_empty() {
                device_name.clone()
            } else {
                display_name
            },
            device_name,
            peer_id,
            model: self.model,
            os: self.os,
            browser: self.browser,
            device_type: self.device_type,
        }
    }
}

fn detect_os(ua: &str) -> Option<&'static str> {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iOS") {
        Some("iOS")
    } else if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("Mac OS") || ua.contains("Macintosh") {
        Some("Mac OS")
    } else if ua.contains("CrOS") {
        Some("Chromium OS")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    }
}

// Order matters: Edge and Opera also claim Chrome, Chrome also claims Safari.
fn detect_browser(ua: &str) -> Option<&'static str> {
    if ua.starts_with("peerdrop/") {
        Some("peerdrop")
    } else if ua.contains("Edg/") || ua.contains("Edge/") {
        Some("Edge")
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        Some("Opera")
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        Some("Firefox")
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        Some("Chrome")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else {
        None
    }
}

fn detect_model(ua: &str) -> Option<String> {
    if ua.contains("iPhone") {
        return Some("iPhone".to_string());
    }
    if ua.contains("iPad") {
        return Some("iPad".to_string());
    }
    // Android UAs read "...; Android 14; Pixel 7 Build/..." or "...; Pixel 7) ..."
    let start = ua.find("Android")?;
    let platform = &ua[start..];
    let platform = platform.split(')').next()?;
    let model = platform.split(';').nth(1)?.trim();
    let model = model.split(" Build/").next()?.trim();
    if model.is_empty() || model == "K" || model.starts_with("wv") {
        None
    } else {
        Some(model.to_string())
    }
}

fn detect_type(ua: &str) -> Option<&'static str> {
    if ua.contains("iPad") || (ua.contains("Android") && !ua.contains("Mobile")) {
        Some("tablet")
    } else if ua.contains("Mobile") || ua.contains("iPhone") {
        Some("mobile")
    } else {
        None
    }
}
