use regex::Regex;
use serde::Deserialize;
use std::{fmt, sync::LazyLock};
use tracing::{debug, info};

use super::ResolvedInput;
use crate::error::{PlaybackError, PlaybackResult};

const SURAH_COUNT: u16 = 114;
const MAX_AYAH: u16 = 286; // Al-Baqarah

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})\s*:\s*(\d{1,3})\s*$").expect("valid regex"));

/// Referencia `sura:aleya`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerseRef {
    pub surah: u16,
    pub ayah: u16,
}

impl VerseRef {
    /// Indica si la entrada tiene forma de referencia, válida o no
    pub fn looks_like(input: &str) -> bool {
        REFERENCE_RE.is_match(input)
    }

    pub fn parse(input: &str) -> PlaybackResult<Self> {
        let caps = REFERENCE_RE
            .captures(input)
            .ok_or_else(|| PlaybackError::resolve(input, "expected a URL or surah:ayah"))?;

        let surah: u16 = caps[1]
            .parse()
            .map_err(|_| PlaybackError::resolve(input, "invalid surah number"))?;
        let ayah: u16 = caps[2]
            .parse()
            .map_err(|_| PlaybackError::resolve(input, "invalid ayah number"))?;

        if !(1..=SURAH_COUNT).contains(&surah) {
            return Err(PlaybackError::resolve(
                input,
                format!("surah must be between 1 and {}", SURAH_COUNT),
            ));
        }
        if !(1..=MAX_AYAH).contains(&ayah) {
            return Err(PlaybackError::resolve(
                input,
                format!("ayah must be between 1 and {}", MAX_AYAH),
            ));
        }

        Ok(Self { surah, ayah })
    }
}

impl fmt::Display for VerseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.surah, self.ayah)
    }
}

#[derive(Debug, Deserialize)]
struct AyahResponse {
    code: u16,
    data: Option<AyahData>,
}

#[derive(Debug, Deserialize)]
struct AyahData {
    audio: Option<String>,
    #[serde(rename = "audioSecondary", default)]
    audio_secondary: Vec<String>,
    surah: Option<SurahInfo>,
}

#[derive(Debug, Deserialize)]
struct SurahInfo {
    #[serde(rename = "englishName")]
    english_name: String,
}

/// Cliente del servicio de recitaciones (API compatible con alquran.cloud)
pub struct QuranClient {
    client: reqwest::Client,
    base_url: String,
    reciter: String,
}

impl QuranClient {
    pub fn new(client: reqwest::Client, base_url: &str, reciter: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            reciter: reciter.to_string(),
        }
    }

    pub fn ayah_endpoint(&self, verse: VerseRef) -> String {
        format!("{}/ayah/{}/{}", self.base_url, verse, self.reciter)
    }

    /// Resuelve una referencia a la URL canónica de su audio
    pub async fn lookup(&self, verse: VerseRef) -> PlaybackResult<ResolvedInput> {
        let endpoint = self.ayah_endpoint(verse);
        debug!("🔍 Buscando audio para {} en {}", verse, endpoint);

        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| PlaybackError::resolve(verse.to_string(), e.to_string()))?;

        if !response.status().is_success() {
            return Err(PlaybackError::resolve(
                verse.to_string(),
                format!("lookup service returned HTTP {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| PlaybackError::resolve(verse.to_string(), e.to_string()))?;

        let resolved = resolve_payload(verse, &body)?;
        info!("✅ Audio resuelto para {}: {}", verse, resolved.url);
        Ok(resolved)
    }
}

/// Extrae la URL de audio y el título de la respuesta del servicio
fn resolve_payload(verse: VerseRef, body: &str) -> PlaybackResult<ResolvedInput> {
    let payload: AyahResponse = serde_json::from_str(body)
        .map_err(|e| PlaybackError::resolve(verse.to_string(), format!("bad lookup payload: {}", e)))?;

    if payload.code != 200 {
        return Err(PlaybackError::resolve(
            verse.to_string(),
            format!("lookup service answered code {}", payload.code),
        ));
    }

    let data = payload
        .data
        .ok_or_else(|| PlaybackError::resolve(verse.to_string(), "lookup payload without data"))?;

    let url = data
        .audio
        .filter(|url| !url.is_empty())
        .or_else(|| data.audio_secondary.into_iter().next())
        .ok_or_else(|| PlaybackError::resolve(verse.to_string(), "no audio for this verse"))?;

    let title = match data.surah {
        Some(surah) => format!("{} {}", surah.english_name, verse),
        None => verse.to_string(),
    };

    Ok(ResolvedInput { url, title })
}
