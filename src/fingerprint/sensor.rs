//! Synthetic bot-management telemetry payloads.
//!
//! Browser-side sensor scripts collect screen geometry, navigator
//! properties, timezone, a canvas hash, and a time-series of pointer events,
//! then POST the bundle to a collector endpoint. This module produces
//! randomised but statistically plausible payloads: screen sizes and
//! timezone offsets drawn from small realistic sets, `webDriver` always
//! false, and a pointer path sampled from a cubic Bézier with ease-in-out
//! timing ending in a single down/up click.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("serialise sensor payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sensor endpoint {0} has no host")]
    BadEndpoint(Url),
}

/// Device screen/viewport geometry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    #[serde(rename = "availWidth")]
    pub avail_width: u32,
    #[serde(rename = "availHeight")]
    pub avail_height: u32,
    #[serde(rename = "colorDepth")]
    pub color_depth: u32,
    #[serde(rename = "pixelDepth")]
    pub pixel_depth: u32,
}

/// The navigator subset collected by sensor scripts.
#[derive(Debug, Clone, Serialize)]
pub struct NavigatorInfo {
    #[serde(rename = "pluginsLength")]
    pub plugins_length: u32,
    pub platform: &'static str,
    pub language: &'static str,
    pub languages: &'static str,
    #[serde(rename = "cookiesEnabled")]
    pub cookies_enabled: bool,
    #[serde(rename = "doNotTrack")]
    pub do_not_track: &'static str,
    #[serde(rename = "hardwareConcurrency")]
    pub hardware_concurrency: u32,
    #[serde(rename = "maxTouchPoints")]
    pub max_touch_points: u32,
    /// navigator.webdriver. Real browsers report false; true is an instant
    /// automation verdict.
    #[serde(rename = "webDriver")]
    pub web_driver: bool,
}

/// Pointer event kinds as encoded on the wire.
pub const EVENT_MOVE: u8 = 0;
pub const EVENT_DOWN: u8 = 1;
pub const EVENT_UP: u8 = 2;

/// One sample in the pointer time series.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MousePoint {
    pub x: f64,
    pub y: f64,
    /// Milliseconds since recording started.
    pub t: i64,
    /// Event kind: 0 move, 1 down, 2 up.
    pub e: u8,
}

/// Top-level sensor object, serialised compactly and POSTed to the
/// collector endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SensorPayload {
    #[serde(rename = "sensor_data_version")]
    pub version: &'static str,
    /// Current `_abck` cookie value; empty on the first hit.
    pub ab: String,
    pub screen: ScreenInfo,
    pub navigator: NavigatorInfo,
    /// Minutes behind UTC, matching `Date.getTimezoneOffset()`.
    #[serde(rename = "timezoneOffset")]
    pub timezone_offset: i32,
    #[serde(rename = "mouseMovements")]
    pub mouse_movements: Vec<MousePoint>,
    /// 8-hex-digit canvas fingerprint placeholder.
    #[serde(rename = "canvasHash")]
    pub canvas_hash: String,
    /// Monotonic sequence counter; the caller advances it per page load.
    pub seq: u64,
    /// Unix millisecond generation time.
    pub timestamp: i64,
}

const SCREENS: [ScreenInfo; 7] = [
    screen(1920, 1080, 1040),
    screen(1366, 768, 728),
    screen(1536, 864, 824),
    screen(1440, 900, 860),
    screen(1280, 720, 680),
    screen(2560, 1440, 1400),
    screen(1600, 900, 860),
];

const fn screen(w: u32, h: u32, avail_h: u32) -> ScreenInfo {
    ScreenInfo {
        width: w,
        height: h,
        avail_width: w,
        avail_height: avail_h,
        color_depth: 24,
        pixel_depth: 24,
    }
}

/// Common Windows-client timezone offsets in minutes. Negative values are
/// ahead of UTC, per the JS convention.
const TIMEZONE_OFFSETS: [i32; 8] = [0, -60, 300, 360, 420, 480, -330, -540];

impl SensorPayload {
    /// Generates a payload with randomised but realistic values. `seq` is
    /// caller-managed and must increase monotonically across page loads.
    pub fn generate(rng: &mut impl Rng, seq: u64) -> Self {
        let screen = SCREENS[rng.gen_range(0..SCREENS.len())];
        let tz = TIMEZONE_OFFSETS[rng.gen_range(0..TIMEZONE_OFFSETS.len())];

        let navigator = NavigatorInfo {
            plugins_length: rng.gen_range(3..=5),
            platform: "Win32",
            language: "en-US",
            languages: "en-US,en",
            cookies_enabled: true,
            do_not_track: "unspecified",
            hardware_concurrency: *[4u32, 4, 4, 8, 8, 8, 12, 16]
                .get(rng.gen_range(0..8))
                .unwrap_or(&8),
            max_touch_points: 0,
            web_driver: false,
        };

        Self {
            version: "2.0",
            ab: String::new(),
            screen,
            navigator,
            timezone_offset: tz,
            mouse_movements: mouse_path(rng, screen.width, screen.height),
            canvas_hash: format!("{:08x}", rng.gen::<u32>()),
            seq,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Compact JSON wire form.
    pub fn to_json(&self) -> Result<String, SensorError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Builds the POST request that submits this payload to `endpoint`,
    /// with the content type and Origin/Referer derivation collectors
    /// expect.
    pub fn to_request(&self, endpoint: &Url) -> Result<reqwest::Request, SensorError> {
        let origin = origin_of(endpoint).ok_or_else(|| SensorError::BadEndpoint(endpoint.clone()))?;
        let body = self.to_json()?;

        let mut req = reqwest::Request::new(reqwest::Method::POST, endpoint.clone());
        let headers = req.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        headers.insert(http::header::ACCEPT, http::HeaderValue::from_static("*/*"));
        if let Ok(value) = http::HeaderValue::from_str(&origin) {
            headers.insert(http::header::ORIGIN, value);
        }
        if let Ok(value) = http::HeaderValue::from_str(&format!("{origin}/")) {
            headers.insert(http::header::REFERER, value);
        }
        headers.insert("sec-fetch-site", http::HeaderValue::from_static("same-origin"));
        headers.insert("sec-fetch-mode", http::HeaderValue::from_static("cors"));
        headers.insert("sec-fetch-dest", http::HeaderValue::from_static("empty"));
        *req.body_mut() = Some(body.into());
        Ok(req)
    }
}

fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut origin = format!("{}://{}", url.scheme(), host);
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}

/// Traces a smooth Bézier arc across the viewport: 18–45 move samples with
/// ease-in-out spacing and sub-pixel jitter, then one mousedown and one
/// mouseup at the terminus. Timestamps are strictly increasing.
fn mouse_path(rng: &mut impl Rng, screen_w: u32, screen_h: u32) -> Vec<MousePoint> {
    let (w, h) = (screen_w as f64, screen_h as f64);
    let n = rng.gen_range(18..=45);

    // Start upper-left, end near the centre (the target element area).
    let x0 = 50.0 + rng.gen_range(0.0..w / 4.0);
    let y0 = 50.0 + rng.gen_range(0.0..h / 4.0);
    let x3 = w / 4.0 + rng.gen_range(0.0..w / 2.0);
    let y3 = h / 4.0 + rng.gen_range(0.0..h / 2.0);

    // Off-axis control points give the arc its curve.
    let x1 = x0 + rng.gen_range(w / 6.0..w / 2.0);
    let y1 = y0 - rng.gen_range(30.0..h / 4.0 + 30.0);
    let x2 = x3 - rng.gen_range(w / 6.0..w / 2.0);
    let y2 = y3 + rng.gen_range(30.0..h / 4.0 + 30.0);

    let base_t = rng.gen_range(800..2000) as i64;
    let mut elapsed = 0i64;
    let mut points = Vec::with_capacity(n + 2);

    for i in 0..n {
        let raw = i as f64 / (n - 1) as f64;
        let t = ease_in_out(raw);
        let (mut x, mut y) = cubic_bezier(t, (x0, y0), (x1, y1), (x2, y2), (x3, y3));

        // Sub-pixel jitter simulating optical-sensor noise.
        x += rng.gen_range(-0.6..0.6);
        y += rng.gen_range(-0.6..0.6);

        // Faster mid-gesture, slower near the endpoints.
        let speed = 0.5 + (std::f64::consts::PI * raw).sin();
        let mut delay = (12.0 / (speed + 0.1)).round() as i64;
        delay += rng.gen_range(-2..=3);
        elapsed += delay.max(4);

        points.push(MousePoint {
            x: (x * 100.0).round() / 100.0,
            y: (y * 100.0).round() / 100.0,
            t: base_t + elapsed,
            e: EVENT_MOVE,
        });
    }

    let last_t = points.last().map(|p| p.t).unwrap_or(base_t);
    points.push(MousePoint {
        x: x3,
        y: y3,
        t: last_t + rng.gen_range(20..60),
        e: EVENT_DOWN,
    });
    points.push(MousePoint {
        x: x3,
        y: y3,
        t: last_t + rng.gen_range(80..200),
        e: EVENT_UP,
    });
    points
}

fn cubic_bezier(t: f64, p0: (f64, f64), p1: (f64, f64), p2: (f64, f64), p3: (f64, f64)) -> (f64, f64) {
    let u = 1.0 - t;
    let x = u * u * u * p0.0 + 3.0 * u * u * t * p1.0 + 3.0 * u * t * t * p2.0 + t * t * t * p3.0;
    let y = u * u * u * p0.1 + 3.0 * u * u * t * p1.1 + 3.0 * u * t * t * p2.1 + t * t * t * p3.1;
    (x, y)
}

fn ease_in_out(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}
