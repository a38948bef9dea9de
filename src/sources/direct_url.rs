use url::Url;

/// Devuelve la URL si la entrada ya es una dirección http(s) descargable
pub fn parse_direct_url(input: &str) -> Option<Url> {
    let url = Url::parse(input.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url),
        _ => None,
    }
}

/// Título legible para una URL directa: el último segmento del path o la URL completa
pub fn title_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let decoded = percent_decode(segment);
            match decoded.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() && ext.len() <= 4 => stem.to_string(),
                _ => decoded,
            }
        })
        .unwrap_or_else(|| url.to_string())
}

fn percent_decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}
