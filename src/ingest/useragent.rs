/// Minimal User-Agent classifier for the browser, OS and device-class dimensions.
///
/// Simple substring matching; more specific patterns are checked first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUserAgent {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
}

/// Parse a User-Agent string into browser, OS and device class.
pub fn parse_user_agent(ua: &str) -> ParsedUserAgent {
    ParsedUserAgent {
        browser: detect_browser(ua).map(String::from),
        os: detect_os(ua).map(String::from),
        device_type: detect_device_type(ua).map(String::from),
    }
}

fn detect_browser(ua: &str) -> Option<&'static str> {
    if ua.contains("Edg/") || ua.contains("Edge/") {
        Some("Edge")
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        Some("Opera")
    } else if ua.contains("SamsungBrowser/") {
        Some("Samsung Internet")
    } else if ua.contains("Chrome/") && !ua.contains("Chromium/") {
        Some("Chrome")
    } else if ua.contains("Safari/") && !ua.contains("Chrome/") {
        Some("Safari")
    } else if ua.contains("Firefox/") {
        Some("Firefox")
    } else {
        None
    }
}

fn detect_os(ua: &str) -> Option<&'static str> {
    if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iOS") {
        // iPhone UAs also contain "Mac OS X"
        Some("iOS")
    } else if ua.contains("Mac OS X") || ua.contains("macOS") {
        Some("macOS")
    } else if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("CrOS") {
        Some("Chrome OS")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    }
}

fn detect_device_type(ua: &str) -> Option<&'static str> {
    if ua.is_empty() {
        None
    } else if ua.contains("iPad") || ua.contains("Tablet") {
        Some("tablet")
    } else if ua.contains("Android") && !ua.contains("Mobile") {
        // Android tablets omit the "Mobile" token
        Some("tablet")
    } else if ua.contains("Mobi") || ua.contains("iPhone") {
        Some("mobile")
    } else if detect_os(ua).is_some() {
        Some("desktop")
    } else {
        None
    }
}
