//! Turning user-supplied URL lists into clean, deduplicated inputs.

use quick_xml::events::Event;
use redirmap_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    Xml,
    Json,
    Csv,
    Text,
}

pub fn detect_format(text: &str) -> InputFormat {
    let t = text.trim_start();
    if t.starts_with('<') {
        return InputFormat::Xml;
    }
    if t.starts_with('[') || t.starts_with('{') {
        return InputFormat::Json;
    }
    let first = t
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'));
    match first {
        Some(l) if l.contains(',') => InputFormat::Csv,
        _ => InputFormat::Text,
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with('/')
}

/// Parse a URL list in any supported format. Output is trimmed and keeps the first
/// occurrence of each URL.
pub fn parse_url_list(text: &str) -> Result<Vec<String>> {
    let format = detect_format(text);
    let raw = match format {
        InputFormat::Xml => parse_sitemap(text)?,
        InputFormat::Json => parse_json(text)?,
        InputFormat::Csv => parse_csv(text),
        InputFormat::Text => parse_lines(text),
    };
    let out = dedup(raw.into_iter().map(|u| u.trim().to_string()).filter(|u| looks_like_url(u)));
    tracing::debug!(format = ?format, urls = out.len(), "parsed url list");
    Ok(out)
}

pub fn dedup(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// `<loc>` values of a sitemap or sitemap index, namespaced or not.
fn parse_sitemap(text: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut out = Vec::new();
    let mut in_loc = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"loc" => in_loc = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"loc" => in_loc = false,
            Ok(Event::Text(t)) if in_loc => {
                let s = t
                    .unescape()
                    .map_err(|e| Error::InvalidInput(format!("sitemap text: {e}")))?;
                out.push(s.into_owned());
            }
            Ok(Event::CData(c)) if in_loc => {
                out.push(String::from_utf8_lossy(&c.into_inner()).into_owned());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::InvalidInput(format!(
                    "invalid sitemap at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }
    Ok(out)
}

fn urls_from_value(v: &serde_json::Value, out: &mut Vec<String>) {
    match v {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|i| urls_from_value(i, out)),
        serde_json::Value::Object(map) => {
            if let Some(urls) = map.get("urls") {
                urls_from_value(urls, out);
                return;
            }
            if let Some(s) = ["url", "loc", "href"]
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
            {
                out.push(s.to_string());
            }
        }
        _ => {}
    }
}

fn parse_json(text: &str) -> Result<Vec<String>> {
    let v: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::InvalidInput(format!("invalid json: {e}")))?;
    let mut out = Vec::new();
    urls_from_value(&v, &mut out);
    Ok(out)
}

/// First field of one CSV line, honoring RFC 4180 quotes.
fn first_csv_field(line: &str) -> String {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('"') else {
        return line.split(',').next().unwrap_or_default().trim().to_string();
    };
    let mut out = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                out.push('"');
                chars.next();
            } else {
                break;
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn parse_csv(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(first_csv_field)
        .collect()
}

fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Path component of an absolute or relative URL, without query or fragment.
fn url_path(u: &str) -> String {
    if let Ok(parsed) = url::Url::parse(u) {
        return parsed.path().to_string();
    }
    let end = u.find(['?', '#']).unwrap_or(u.len());
    u[..end].to_string()
}

const MEDIA_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".bmp", ".tiff", ".css", ".js",
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".xml", ".rss", ".json", ".txt",
    ".zip", ".rar", ".mp4", ".avi", ".mov", ".mp3", ".wav", ".ogg",
];

/// Drops assets (images, scripts, documents, feeds, archives, audio/video) from page lists.
#[derive(Debug, Clone)]
pub struct MediaFilter {
    extensions: BTreeSet<String>,
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self {
            extensions: MEDIA_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MediaFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `pdf` or `.pdf`.
    pub fn with_extension(mut self, ext: &str) -> Self {
        let ext = ext.trim().to_ascii_lowercase();
        if !ext.is_empty() {
            let ext = if ext.starts_with('.') { ext } else { format!(".{ext}") };
            self.extensions.insert(ext);
        }
        self
    }

    pub fn is_media(&self, url: &str) -> bool {
        let path = url_path(url.trim()).to_ascii_lowercase();
        self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }

    /// Split into (pages, media).
    pub fn partition(&self, urls: Vec<String>) -> (Vec<String>, Vec<String>) {
        let (media, pages): (Vec<String>, Vec<String>) =
            urls.into_iter().partition(|u| self.is_media(u));
        if !media.is_empty() {
            tracing::info!(removed = media.len(), kept = pages.len(), "filtered media urls");
        }
        (pages, media)
    }
}

/// Removes staging artifacts from URL paths.
#[derive(Debug, Clone, Default)]
pub struct UrlCleaner {
    patterns: Vec<String>,
}

impl UrlCleaner {
    pub fn new(patterns: impl IntoIterator<Item = String>) -> Self {
        Self {
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }

    fn clean_path(&self, path: &str) -> String {
        let mut p = path.to_string();
        for pat in &self.patterns {
            p = p.replace(pat.as_str(), "/");
        }
        while p.contains("//") {
            p = p.replace("//", "/");
        }
        if p != "/" && p.ends_with('/') && !path.ends_with('/') {
            p.truncate(p.len() - 1);
        }
        p
    }

    pub fn clean(&self, u: &str) -> String {
        if let Ok(mut parsed) = url::Url::parse(u) {
            let cleaned = self.clean_path(parsed.path());
            if cleaned == parsed.path() {
                return u.to_string();
            }
            parsed.set_path(&cleaned);
            return parsed.to_string();
        }
        let end = u.find(['?', '#']).unwrap_or(u.len());
        let (path, tail) = u.split_at(end);
        format!("{}{tail}", self.clean_path(path))
    }

    pub fn clean_all(&self, urls: &[String]) -> Vec<String> {
        urls.iter().map(|u| self.clean(u)).collect()
    }
}

/// Most frequent host among absolute URLs (scheme-less `host.tld/...` counts as https).
/// Returns `scheme://host`, preferring https when the host was seen with both.
pub fn detect_domain(urls: &[String]) -> Option<String> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, (usize, bool)> = HashMap::new();

    for u in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty() && !u.starts_with('/')) {
        let candidate = if u.contains("://") {
            u.to_string()
        } else {
            format!("https://{u}")
        };
        let Ok(parsed) = url::Url::parse(&candidate) else {
            continue;
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            continue;
        }
        let Some(host) = parsed.host_str().filter(|h| h.contains('.') && !h.starts_with('.'))
        else {
            continue;
        };
        let netloc = match parsed.port() {
            Some(p) => format!("{host}:{p}"),
            None => host.to_string(),
        };
        let entry = counts.entry(netloc.clone()).or_insert_with(|| {
            order.push(netloc.clone());
            (0, false)
        });
        entry.0 += 1;
        entry.1 |= parsed.scheme() == "https";
    }

    let mut best: Option<(&String, usize, bool)> = None;
    for netloc in &order {
        let (n, https) = counts[netloc];
        if best.map_or(true, |(_, bn, _)| n > bn) {
            best = Some((netloc, n, https));
        }
    }
    best.map(|(netloc, _, https)| {
        let scheme = if https { "https" } else { "http" };
        format!("{scheme}://{netloc}")
    })
}
