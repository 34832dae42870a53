//! Coarse device classification of a client's user agent.
//!
//! The key partitions session storage per device. It is trivially spoofable
//! and is never treated as proof of identity.

/// Normalize a raw user-agent string to an `{os}_{browser}` key.
pub fn normalize_device(user_agent: &str) -> String {
    let ua = user_agent.to_ascii_lowercase();

    // Android and iOS agents also mention Linux / Mac OS, so check them first.
    let os = if ua.contains("android") {
        "android"
    } else if ua.contains("iphone") || ua.contains("ipad") {
        "ios"
    } else if ua.contains("windows") {
        "windows"
    } else if ua.contains("macintosh") || ua.contains("mac os") {
        "macos"
    } else if ua.contains("linux") {
        "linux"
    } else {
        "unknown"
    };

    // Edge and Opera agents carry a Chrome token too.
    let browser = if ua.contains("edg") {
        "edge"
    } else if ua.contains("opera") || ua.contains("opr/") {
        "opera"
    } else if ua.contains("chrome") || ua.contains("crios") {
        "chrome"
    } else if ua.contains("firefox") || ua.contains("fxios") {
        "firefox"
    } else if ua.contains("safari") {
        "safari"
    } else {
        "unknown"
    };

    format!("{os}_{browser}")
}
