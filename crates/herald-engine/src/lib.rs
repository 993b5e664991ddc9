use std::collections::HashMap;
use std::env;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use herald_contracts::events::{EventPayload, EventWriter};
use herald_contracts::presence::PresenceSnapshot;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const CANVAS_WIDTH: u32 = 1000;
pub const CANVAS_HEIGHT: u32 = 300;
pub const PORTRAIT_MARGIN: u32 = 5;
pub const PORTRAIT_SIZE: u32 = 290;

const TEXT_COLUMN_X: u32 = 320;
const TITLE_COLOR: Rgb<u8> = Rgb([220, 220, 220]);
const NAME_COLOR: Rgb<u8> = Rgb([255, 215, 0]);
const DETAIL_COLOR: Rgb<u8> = Rgb([150, 150, 150]);

/// Continuous-refill token bucket guarding the image-synthesis call.
///
/// No blocking or queuing: a denied caller falls back to the placeholder
/// path rather than wait. Bursts are smoothed instead of resetting at
/// window boundaries.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, per: Duration) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_second: capacity / per.as_secs_f64().max(f64::EPSILON),
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;

        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

/// One encoded image payload returned by a synthesis backend.
#[derive(Debug, Clone)]
pub struct SynthesizedImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

impl SynthesizedImage {
    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.bytes).context("synthesized image decode failed")
    }
}

pub trait ImageSynthesizer: Send + Sync {
    fn name(&self) -> &str;
    /// Issues one synchronous synthesis call. `Ok(None)` means the backend
    /// answered without an image payload (e.g. a text-only refusal).
    fn synthesize(&self, prompt: &str) -> Result<Option<SynthesizedImage>>;
}

/// Deterministic offline synthesizer: a flat pigment derived from the
/// prompt digest. Used for dry runs and tests.
pub struct DryrunSynthesizer;

impl ImageSynthesizer for DryrunSynthesizer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn synthesize(&self, prompt: &str) -> Result<Option<SynthesizedImage>> {
        let (r, g, b) = color_from_prompt(prompt);
        let mut image = RgbImage::new(512, 512);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let bytes = encode_png(&image)?;
        Ok(Some(SynthesizedImage {
            bytes,
            mime_type: Some("image/png".to_string()),
        }))
    }
}

pub struct GeminiSynthesizer {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiSynthesizer {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: model.into(),
            http: HttpClient::new(),
        }
    }

    pub fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn default_safety_settings() -> Vec<Value> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| {
            json!({
                "category": category,
                "threshold": "OFF",
            })
        })
        .collect()
    }

    fn request_timeout() -> Duration {
        let seconds = env::var("HERALD_SYNTH_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(|value| value.clamp(15, 300))
            .unwrap_or(90);
        Duration::from_secs(seconds)
    }
}

impl ImageSynthesizer for GeminiSynthesizer {
    fn name(&self) -> &str {
        "gemini"
    }

    fn synthesize(&self, prompt: &str) -> Result<Option<SynthesizedImage>> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": "1:1",
                    "imageSize": "1K",
                },
            },
            "safetySettings": Self::default_safety_settings(),
        });

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .timeout(Self::request_timeout())
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Gemini", response)?;
        extract_image_payload(&response_payload)
    }
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{label} response read failed"))?;
    if !status.is_success() {
        bail!("{label} request returned {status}: {}", truncate(&body, 400));
    }
    serde_json::from_str(&body).with_context(|| format!("{label} response was not valid JSON"))
}

/// Pulls the first inline image part out of a generateContent response.
/// Tolerates both camelCase and snake_case inline-data keys across API
/// revisions.
pub fn extract_image_payload(response_payload: &Value) -> Result<Option<SynthesizedImage>> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let inline = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("inline image base64 decode failed")?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(Some(SynthesizedImage { bytes, mime_type }));
        }
    }

    Ok(None)
}

/// Rate-limited front door to image synthesis. Admission is checked before
/// any network call; every failure mode past admission degrades to `None`
/// so composition can fall back to the placeholder panel.
pub struct Artist {
    limiter: RateLimiter,
    synthesizer: Arc<dyn ImageSynthesizer>,
    events: EventWriter,
}

impl Artist {
    pub fn new(synthesizer: Arc<dyn ImageSynthesizer>, events: EventWriter) -> Self {
        Self {
            limiter: RateLimiter::default(),
            synthesizer,
            events,
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn synthesizer(&self) -> Arc<dyn ImageSynthesizer> {
        Arc::clone(&self.synthesizer)
    }

    /// Token-bucket admission. Called on the command loop only; denial is
    /// logged and the caller skips synthesis entirely.
    pub fn admit(&mut self) -> bool {
        if self.limiter.try_acquire() {
            return true;
        }
        let _ = self.events.emit(
            "synthesis_rate_limited",
            payload(json!({ "synthesizer": self.synthesizer.name() })),
        );
        false
    }

    pub fn generate(&mut self, prompt: &str) -> Option<DynamicImage> {
        if !self.admit() {
            return None;
        }
        synthesize_logged(self.synthesizer.as_ref(), &self.events, prompt)
    }
}

/// Runs one synthesis call and decodes the result, folding every failure
/// into `None` with an event. Safe to call from an offload thread.
pub fn synthesize_logged(
    synthesizer: &dyn ImageSynthesizer,
    events: &EventWriter,
    prompt: &str,
) -> Option<DynamicImage> {
    let digest = prompt_digest(prompt);
    let _ = events.emit(
        "synthesis_requested",
        payload(json!({
            "synthesizer": synthesizer.name(),
            "prompt_sha": digest,
        })),
    );

    match synthesizer.synthesize(prompt) {
        Ok(Some(image)) => match image.decode() {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                let _ = events.emit(
                    "synthesis_failed",
                    payload(json!({
                        "prompt_sha": digest,
                        "error": format!("{err:#}"),
                    })),
                );
                None
            }
        },
        Ok(None) => {
            let _ = events.emit(
                "synthesis_empty",
                payload(json!({ "prompt_sha": digest })),
            );
            None
        }
        Err(err) => {
            let _ = events.emit(
                "synthesis_failed",
                payload(json!({
                    "prompt_sha": digest,
                    "error": format!("{err:#}"),
                })),
            );
            None
        }
    }
}

/// Builds the portrait prompt from a translated presence snapshot.
pub fn portrait_prompt(snapshot: &PresenceSnapshot) -> String {
    format!(
        "Oil painting, medieval dark fantasy style. \
         Subject: {rank} {name}. \
         Location/Realm: {realm}. \
         Activity/Context: {activity}. \
         Year: {year}. \
         Note: Consider the cultural origin of the name '{name}' \
         (e.g. Jewish, Germanic, etc.) for the character's ethnic appearance and attire. \
         High contrast, rough brushstrokes, atmospheric lighting.",
        rank = snapshot.rank,
        name = snapshot.actual_name,
        realm = snapshot.realm,
        activity = snapshot.raw_activity,
        year = snapshot.year,
    )
}

/// Text rows drawn on the banner. Missing fields render as defined
/// defaults, never blank.
#[derive(Debug, Clone, Default)]
pub struct BannerFields {
    pub title: Option<String>,
    pub name: Option<String>,
    pub date: Option<String>,
    pub status: Option<String>,
    pub lifestyle: Option<String>,
}

impl BannerFields {
    pub fn from_snapshot(snapshot: &PresenceSnapshot) -> Self {
        Self {
            title: Some(snapshot.rank.clone()),
            name: Some(snapshot.actual_name.clone()),
            date: Some(snapshot.year.clone()),
            status: Some(snapshot.raw_activity.clone()),
            lifestyle: None,
        }
    }
}

/// Deterministic banner compositor: fixed 1000x300 canvas, portrait region
/// at the left edge, text rows at fixed coordinates. The no-portrait path
/// never fails.
pub struct BannerComposer {
    background: RgbImage,
    font: FontAtlas,
}

impl BannerComposer {
    /// Loads the background layer and font, degrading to the procedural
    /// panel and built-in bitmap font when assets are missing or
    /// malformed. Asset problems are logged, never fatal.
    pub fn new(background: Option<&Path>, font: Option<&Path>, events: &EventWriter) -> Self {
        let background = match background {
            Some(path) => match load_background(path) {
                Ok((layer, resized)) => {
                    if resized {
                        let _ = events.emit(
                            "background_resized",
                            payload(json!({ "path": path.to_string_lossy().to_string() })),
                        );
                    }
                    layer
                }
                Err(err) => {
                    let _ = events.emit(
                        "background_missing",
                        payload(json!({
                            "path": path.to_string_lossy().to_string(),
                            "error": format!("{err:#}"),
                        })),
                    );
                    procedural_background()
                }
            },
            None => procedural_background(),
        };

        let font = match font {
            Some(path) => match FontAtlas::load_sheet(path) {
                Ok(atlas) => atlas,
                Err(err) => {
                    let _ = events.emit(
                        "font_fallback",
                        payload(json!({
                            "path": path.to_string_lossy().to_string(),
                            "error": format!("{err:#}"),
                        })),
                    );
                    FontAtlas::builtin()
                }
            },
            None => FontAtlas::builtin(),
        };

        Self { background, font }
    }

    /// Composites the banner and returns encoded PNG bytes. A missing
    /// portrait draws the placeholder panel instead; this path never
    /// fails.
    pub fn compose(
        &self,
        portrait: Option<&DynamicImage>,
        fields: &BannerFields,
    ) -> Result<Vec<u8>> {
        let mut canvas = self.background.clone();

        match portrait {
            Some(image) => {
                let fitted = image
                    .resize_to_fill(PORTRAIT_SIZE, PORTRAIT_SIZE, FilterType::Triangle)
                    .to_rgb8();
                image::imageops::replace(
                    &mut canvas,
                    &fitted,
                    i64::from(PORTRAIT_MARGIN),
                    i64::from(PORTRAIT_MARGIN),
                );
            }
            None => self.draw_placeholder(&mut canvas),
        }

        let title = fields.title.as_deref().unwrap_or("Unknown Title");
        let name = fields.name.as_deref().unwrap_or("Unknown Character");
        let date = fields.date.as_deref().unwrap_or("Unknown");
        let status = fields.status.as_deref().unwrap_or("Idle");

        self.font
            .draw_text(&mut canvas, TEXT_COLUMN_X, 20, title, 5, TITLE_COLOR);
        self.font
            .draw_text(&mut canvas, TEXT_COLUMN_X, 70, name, 8, NAME_COLOR);
        self.font.draw_text(
            &mut canvas,
            TEXT_COLUMN_X,
            150,
            &format!("Year: {date}"),
            3,
            DETAIL_COLOR,
        );
        self.font.draw_text(
            &mut canvas,
            TEXT_COLUMN_X,
            190,
            &format!("Status: {status}"),
            3,
            DETAIL_COLOR,
        );
        if let Some(lifestyle) = fields.lifestyle.as_deref() {
            self.font.draw_text(
                &mut canvas,
                TEXT_COLUMN_X,
                230,
                &format!("Lifestyle: {lifestyle}"),
                3,
                DETAIL_COLOR,
            );
        }

        encode_png(&canvas)
    }

    fn draw_placeholder(&self, canvas: &mut RgbImage) {
        fill_rect(
            canvas,
            PORTRAIT_MARGIN,
            PORTRAIT_MARGIN,
            PORTRAIT_SIZE,
            PORTRAIT_SIZE,
            Rgb([50, 20, 20]),
        );
        let marker = "NO SIGNAL";
        let scale = 4;
        let width = self.font.text_width(marker, scale);
        let height = self.font.text_height(scale);
        let x = PORTRAIT_MARGIN + PORTRAIT_SIZE.saturating_sub(width) / 2;
        let y = PORTRAIT_MARGIN + PORTRAIT_SIZE.saturating_sub(height) / 2;
        self.font
            .draw_text(canvas, x, y, marker, scale, Rgb([200, 200, 200]));
    }
}

fn load_background(path: &Path) -> Result<(RgbImage, bool)> {
    let image = image::open(path)
        .with_context(|| format!("failed to open background {}", path.display()))?
        .to_rgb8();
    if image.dimensions() == (CANVAS_WIDTH, CANVAS_HEIGHT) {
        return Ok((image, false));
    }
    let resized = DynamicImage::ImageRgb8(image)
        .resize_exact(CANVAS_WIDTH, CANVAS_HEIGHT, FilterType::Triangle)
        .to_rgb8();
    Ok((resized, true))
}

/// Dark textured panel used when no background asset is available.
fn procedural_background() -> RgbImage {
    let mut image = RgbImage::from_pixel(CANVAS_WIDTH, CANVAS_HEIGHT, Rgb([25, 20, 30]));

    for start in (0..CANVAS_WIDTH).step_by(20) {
        for y in 0..CANVAS_HEIGHT {
            let x = start + y * 10 / CANVAS_HEIGHT;
            for dx in 0..2 {
                let px = x + dx;
                if px < CANVAS_WIDTH {
                    image.put_pixel(px, y, Rgb([35, 30, 40]));
                }
            }
        }
    }

    let border = Rgb([60, 50, 40]);
    for y in 0..CANVAS_HEIGHT {
        for x in 0..CANVAS_WIDTH {
            if x < 5 || x >= CANVAS_WIDTH - 5 || y < 5 || y >= CANVAS_HEIGHT - 5 {
                image.put_pixel(x, y, border);
            }
        }
    }
    image
}

fn fill_rect(canvas: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    for dy in 0..height {
        for dx in 0..width {
            let px = x + dx;
            let py = y + dy;
            if px < canvas.width() && py < canvas.height() {
                canvas.put_pixel(px, py, color);
            }
        }
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("PNG encode failed")?;
    Ok(bytes)
}

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// Built-in 5x7 glyph rows, one byte per row, low 5 bits used with bit 4
/// as the leftmost column. Covers uppercase letters, digits and common
/// punctuation; lowercase input is drawn with the uppercase glyph.
#[rustfmt::skip]
const BUILTIN_GLYPHS: [(char, [u8; 7]); 44] = [
    ('A', [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11]),
    ('B', [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E]),
    ('C', [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E]),
    ('D', [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E]),
    ('E', [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F]),
    ('F', [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10]),
    ('G', [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0E]),
    ('H', [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11]),
    ('I', [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E]),
    ('J', [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C]),
    ('K', [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11]),
    ('L', [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F]),
    ('M', [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11]),
    ('N', [0x11, 0x19, 0x15, 0x13, 0x11, 0x11, 0x11]),
    ('O', [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E]),
    ('P', [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10]),
    ('Q', [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D]),
    ('R', [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11]),
    ('S', [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E]),
    ('T', [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04]),
    ('U', [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E]),
    ('V', [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04]),
    ('W', [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11]),
    ('X', [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11]),
    ('Y', [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04]),
    ('Z', [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F]),
    ('0', [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E]),
    ('1', [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E]),
    ('2', [0x0E, 0x11, 0x01, 0x06, 0x08, 0x10, 0x1F]),
    ('3', [0x1F, 0x01, 0x02, 0x06, 0x01, 0x11, 0x0E]),
    ('4', [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02]),
    ('5', [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E]),
    ('6', [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E]),
    ('7', [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08]),
    ('8', [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E]),
    ('9', [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C]),
    ('.', [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C]),
    (':', [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00]),
    ('-', [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00]),
    ('\'', [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00]),
    (',', [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08]),
    ('/', [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10]),
    ('!', [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04]),
    ('?', [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04]),
];

/// Fixed-cell bitmap font. Either the built-in 5x7 set or a glyph-sheet
/// PNG asset (16x6 grid covering ASCII 32..127).
pub struct FontAtlas {
    glyph_width: u32,
    glyph_height: u32,
    glyphs: HashMap<char, Vec<bool>>,
}

impl FontAtlas {
    pub fn builtin() -> Self {
        let mut glyphs = HashMap::new();
        for (ch, rows) in BUILTIN_GLYPHS {
            let mut bitmap = Vec::with_capacity((GLYPH_WIDTH * GLYPH_HEIGHT) as usize);
            for row in rows {
                for col in 0..GLYPH_WIDTH {
                    bitmap.push(row & (1 << (GLYPH_WIDTH - 1 - col)) != 0);
                }
            }
            glyphs.insert(ch, bitmap);
        }
        Self {
            glyph_width: GLYPH_WIDTH,
            glyph_height: GLYPH_HEIGHT,
            glyphs,
        }
    }

    /// Loads a glyph-sheet asset: 16 columns by 6 rows of equal cells
    /// covering ASCII 32..127, bright pixels marking glyph coverage.
    pub fn load_sheet(path: &Path) -> Result<Self> {
        let sheet = image::open(path)
            .with_context(|| format!("failed to open font sheet {}", path.display()))?
            .to_luma8();
        let glyph_width = sheet.width() / 16;
        let glyph_height = sheet.height() / 6;
        if glyph_width == 0 || glyph_height == 0 {
            bail!("font sheet {} is too small", path.display());
        }

        let mut glyphs = HashMap::new();
        for code in 32u8..127 {
            let index = u32::from(code - 32);
            let origin_x = (index % 16) * glyph_width;
            let origin_y = (index / 16) * glyph_height;
            let mut bitmap = Vec::with_capacity((glyph_width * glyph_height) as usize);
            for dy in 0..glyph_height {
                for dx in 0..glyph_width {
                    let value = sheet.get_pixel(origin_x + dx, origin_y + dy).0[0];
                    bitmap.push(value > 127);
                }
            }
            glyphs.insert(char::from(code), bitmap);
        }
        Ok(Self {
            glyph_width,
            glyph_height,
            glyphs,
        })
    }

    fn glyph(&self, ch: char) -> Option<&[bool]> {
        self.glyphs
            .get(&ch)
            .or_else(|| self.glyphs.get(&ch.to_ascii_uppercase()))
            .or_else(|| self.glyphs.get(&'?'))
            .map(Vec::as_slice)
    }

    pub fn text_width(&self, text: &str, scale: u32) -> u32 {
        let count = text.chars().count() as u32;
        count * (self.glyph_width + 1) * scale
    }

    pub fn text_height(&self, scale: u32) -> u32 {
        self.glyph_height * scale
    }

    pub fn draw_text(
        &self,
        canvas: &mut RgbImage,
        x: u32,
        y: u32,
        text: &str,
        scale: u32,
        color: Rgb<u8>,
    ) {
        let advance = (self.glyph_width + 1) * scale;
        let mut cursor_x = x;
        for ch in text.chars() {
            if ch != ' ' {
                if let Some(bitmap) = self.glyph(ch) {
                    self.draw_glyph(canvas, cursor_x, y, bitmap, scale, color);
                }
            }
            cursor_x += advance;
            if cursor_x >= canvas.width() {
                break;
            }
        }
    }

    fn draw_glyph(
        &self,
        canvas: &mut RgbImage,
        x: u32,
        y: u32,
        bitmap: &[bool],
        scale: u32,
        color: Rgb<u8>,
    ) {
        for gy in 0..self.glyph_height {
            for gx in 0..self.glyph_width {
                if !bitmap[(gy * self.glyph_width + gx) as usize] {
                    continue;
                }
                for sy in 0..scale {
                    for sx in 0..scale {
                        let px = x + gx * scale + sx;
                        let py = y + gy * scale + sy;
                        if px < canvas.width() && py < canvas.height() {
                            canvas.put_pixel(px, py, color);
                        }
                    }
                }
            }
        }
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

pub fn prompt_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use base64::Engine as _;
    use herald_contracts::events::EventWriter;
    use herald_contracts::presence::{translate, RichPresence};
    use serde_json::json;

    use super::*;

    fn test_events(dir: &Path) -> EventWriter {
        EventWriter::new(dir.join("events.jsonl"), "test")
    }

    #[test]
    fn rate_limiter_allows_capacity_then_denies() {
        let mut limiter = RateLimiter::new(5, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at(now));
        }
        assert!(!limiter.try_acquire_at(now));
    }

    #[test]
    fn rate_limiter_refills_continuously_and_clamps() {
        let mut limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at(start));
        }
        assert!(!limiter.try_acquire_at(start));

        // One refill interval restores one token; far more restores at
        // most the full capacity.
        let after_one = start + Duration::from_secs(12);
        assert!(limiter.try_acquire_at(after_one));
        assert!(!limiter.try_acquire_at(after_one));

        let much_later = after_one + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(limiter.try_acquire_at(much_later));
        }
        assert!(!limiter.try_acquire_at(much_later));
    }

    #[test]
    fn rate_limiter_denial_keeps_refill() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.try_acquire_at(start));

        let half = start + Duration::from_secs(5);
        assert!(!limiter.try_acquire_at(half));
        // The half-token from the denied check is retained.
        let full = half + Duration::from_secs(5);
        assert!(limiter.try_acquire_at(full));
    }

    #[test]
    fn compose_without_portrait_never_fails() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let composer = BannerComposer::new(None, None, &test_events(temp.path()));
        let bytes = composer.compose(None, &BannerFields::default())?;
        assert!(!bytes.is_empty());

        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (CANVAS_WIDTH, CANVAS_HEIGHT));
        // The placeholder panel fills the portrait region.
        assert_eq!(decoded.get_pixel(20, 20), &Rgb([50, 20, 20]));
        Ok(())
    }

    #[test]
    fn compose_fits_any_portrait_aspect_ratio() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let composer = BannerComposer::new(None, None, &test_events(temp.path()));
        let wide = DynamicImage::ImageRgb8(RgbImage::from_pixel(800, 100, Rgb([9, 120, 40])));
        let bytes = composer.compose(Some(&wide), &BannerFields::default())?;

        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (CANVAS_WIDTH, CANVAS_HEIGHT));
        // The portrait region carries the supplied image, not the
        // placeholder.
        assert_eq!(decoded.get_pixel(150, 150), &Rgb([9, 120, 40]));
        Ok(())
    }

    #[test]
    fn composer_falls_back_when_assets_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(temp.path());
        let composer = BannerComposer::new(
            Some(&temp.path().join("missing-bg.png")),
            Some(&temp.path().join("missing-font.png")),
            &events,
        );
        let bytes = composer.compose(None, &BannerFields::default())?;
        assert!(!bytes.is_empty());

        let raw = std::fs::read_to_string(events.path())?;
        assert!(raw.contains("background_missing"));
        assert!(raw.contains("font_fallback"));
        Ok(())
    }

    #[test]
    fn custom_background_is_resized_to_canvas() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let bg_path = temp.path().join("background.png");
        RgbImage::from_pixel(10, 10, Rgb([1, 2, 3])).save(&bg_path)?;

        let events = test_events(temp.path());
        let composer = BannerComposer::new(Some(&bg_path), None, &events);
        let bytes = composer.compose(None, &BannerFields::default())?;
        let decoded = image::load_from_memory(&bytes)?.to_rgb8();
        assert_eq!(decoded.dimensions(), (CANVAS_WIDTH, CANVAS_HEIGHT));

        let raw = std::fs::read_to_string(events.path())?;
        assert!(raw.contains("background_resized"));
        Ok(())
    }

    #[test]
    fn dryrun_synthesizer_is_deterministic() -> anyhow::Result<()> {
        let synth = DryrunSynthesizer;
        let first = synth.synthesize("castle at dusk")?.unwrap();
        let second = synth.synthesize("castle at dusk")?.unwrap();
        let other = synth.synthesize("castle at dawn")?.unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_ne!(first.bytes, other.bytes);
        assert!(first.decode().is_ok());
        Ok(())
    }

    #[test]
    fn artist_rate_limit_denial_skips_synthesis() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = test_events(temp.path());
        let mut artist = Artist::new(Arc::new(DryrunSynthesizer), events.clone())
            .with_limiter(RateLimiter::new(1, Duration::from_secs(3600)));

        assert!(artist.generate("first").is_some());
        assert!(artist.generate("second").is_none());

        let raw = std::fs::read_to_string(events.path())?;
        assert!(raw.contains("synthesis_rate_limited"));
        Ok(())
    }

    #[test]
    fn extract_image_payload_reads_camel_and_snake_case() -> anyhow::Result<()> {
        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3]);
        let camel = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "a caption" },
                    { "inlineData": { "mimeType": "image/png", "data": data } },
                ]},
            }],
        });
        let image = extract_image_payload(&camel)?.unwrap();
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));

        let snake = json!({
            "candidates": [{
                "content": { "parts": [
                    { "inline_data": { "mime_type": "image/webp", "data": data } },
                ]},
            }],
        });
        let image = extract_image_payload(&snake)?.unwrap();
        assert_eq!(image.mime_type.as_deref(), Some("image/webp"));
        Ok(())
    }

    #[test]
    fn extract_image_payload_text_only_refusal_is_none() -> anyhow::Result<()> {
        let refusal = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "I cannot draw that." }] },
            }],
        });
        assert!(extract_image_payload(&refusal)?.is_none());
        assert!(extract_image_payload(&json!({}))?.is_none());
        Ok(())
    }

    #[test]
    fn portrait_prompt_carries_snapshot_fields() {
        let snapshot = translate(&RichPresence::from_map(
            json!({
                "character": "King Bob of Wessex",
                "flavor": "Ruling as",
                "Year": "1066",
            })
            .as_object()
            .cloned()
            .unwrap(),
        ));
        let prompt = portrait_prompt(&snapshot);
        assert!(prompt.contains("King Bob"));
        assert!(prompt.contains("Wessex"));
        assert!(prompt.contains("1066"));
        assert!(prompt.contains("Ruling as"));
    }

    #[test]
    fn builtin_font_measures_and_draws() {
        let font = FontAtlas::builtin();
        assert_eq!(font.text_width("NO SIGNAL", 4), 9 * 6 * 4);
        assert_eq!(font.text_height(4), 28);

        let mut canvas = RgbImage::from_pixel(100, 40, Rgb([0, 0, 0]));
        font.draw_text(&mut canvas, 2, 2, "A1", 2, Rgb([255, 255, 255]));
        let lit = canvas
            .pixels()
            .filter(|pixel| **pixel == Rgb([255, 255, 255]))
            .count();
        assert!(lit > 0);
    }

    #[test]
    fn font_sheet_loading_requires_plausible_dimensions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let sheet_path = temp.path().join("font.png");
        RgbImage::from_pixel(160, 60, Rgb([255, 255, 255])).save(&sheet_path)?;
        let atlas = FontAtlas::load_sheet(&sheet_path)?;
        assert_eq!(atlas.text_height(1), 10);

        let tiny_path = temp.path().join("tiny.png");
        RgbImage::from_pixel(8, 4, Rgb([255, 255, 255])).save(&tiny_path)?;
        assert!(FontAtlas::load_sheet(&tiny_path).is_err());
        Ok(())
    }
}
