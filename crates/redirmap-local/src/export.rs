//! Apache `.htaccess`, CSV and JSON renderings of a redirect set.

use redirmap_core::{Error, LanguageClassifier, RedirectRecord, RedirectStatus, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Apache `Redirect` wants a URL path; absolute sources are reduced to path + query.
pub fn source_path(source: &str) -> String {
    match url::Url::parse(source) {
        Ok(u) if u.has_host() => match u.query() {
            Some(q) => format!("{}?{q}", u.path()),
            None => u.path().to_string(),
        },
        _ => source.to_string(),
    }
}

fn htaccess_arg(s: &str) -> String {
    if s.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn render_htaccess(records: &[RedirectRecord]) -> String {
    let (permanent, temporary): (Vec<&RedirectRecord>, Vec<&RedirectRecord>) = records
        .iter()
        .partition(|r| r.status == RedirectStatus::Permanent);

    let mut out = String::new();
    out.push_str("# Generated by redirmap\n");
    out.push_str(&format!(
        "# {} permanent (301), {} temporary (302)\n",
        permanent.len(),
        temporary.len()
    ));

    if !permanent.is_empty() {
        out.push_str("\n# ---- 301 permanent redirects ----\n");
        for r in &permanent {
            let reason = one_line(&r.reason);
            let reason = if reason.is_empty() { "match".to_string() } else { reason };
            out.push_str(&format!("# {reason} (confidence: {:.2})\n", r.confidence));
            out.push_str(&format!(
                "Redirect 301 {} {}\n",
                htaccess_arg(&source_path(&r.source)),
                htaccess_arg(&r.target)
            ));
        }
    }

    if !temporary.is_empty() {
        out.push_str("\n# ---- 302 temporary fallbacks, review manually ----\n");
        let mut targets: Vec<&str> = Vec::new();
        for r in &temporary {
            if !targets.contains(&r.target.as_str()) {
                targets.push(&r.target);
            }
        }
        for target in targets {
            let group: Vec<&&RedirectRecord> =
                temporary.iter().filter(|r| r.target == target).collect();
            out.push_str(&format!(
                "\n# Temporary fallback to {target} ({} URL(s))\n",
                group.len()
            ));
            for r in group {
                out.push_str(&format!(
                    "Redirect 302 {} {}\n",
                    htaccess_arg(&source_path(&r.source)),
                    htaccess_arg(&r.target)
                ));
            }
        }
    }
    out
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn render_csv(records: &[RedirectRecord], classifier: &LanguageClassifier) -> String {
    let mut out = String::from("source,target,status,confidence,reason,language\n");
    for r in records {
        let row = [
            csv_field(&r.source),
            csv_field(&r.target),
            r.status.code().to_string(),
            format!("{:.2}", r.confidence),
            csv_field(&r.reason),
            classifier.detect(&r.source).to_string(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportPaths {
    pub htaccess: PathBuf,
    pub csv: PathBuf,
    pub json: PathBuf,
}

/// Write `redirects.htaccess`, `redirects.csv` and `redirects.json` into `dir`.
pub fn write_all(
    dir: &Path,
    records: &[RedirectRecord],
    classifier: &LanguageClassifier,
) -> Result<ExportPaths> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Export(format!("create {}: {e}", dir.display())))?;
    let paths = ExportPaths {
        htaccess: dir.join("redirects.htaccess"),
        csv: dir.join("redirects.csv"),
        json: dir.join("redirects.json"),
    };
    let json = serde_json::to_string_pretty(records).map_err(|e| Error::Export(e.to_string()))?;
    for (p, body) in [
        (&paths.htaccess, render_htaccess(records)),
        (&paths.csv, render_csv(records, classifier)),
        (&paths.json, json),
    ] {
        std::fs::write(p, body).map_err(|e| Error::Export(format!("write {}: {e}", p.display())))?;
    }
    tracing::info!(dir = %dir.display(), records = records.len(), "wrote redirect files");
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(source: &str, target: &str, status: RedirectStatus, confidence: f64, reason: &str) -> RedirectRecord {
        RedirectRecord {
            source: source.to_string(),
            target: target.to_string(),
            status,
            confidence,
            reason: reason.to_string(),
        }
    }

    fn sample() -> Vec<RedirectRecord> {
        vec![
            rec(
                "https://old.example.com/fr/contact?x=1",
                "/fr/nous-contacter",
                RedirectStatus::Permanent,
                0.9,
                "same page,\nnew slug",
            ),
            rec("/es/contacto", "/fr/", RedirectStatus::Temporary, 0.0, "language es not migrated"),
            rec("/de/seite", "/de/", RedirectStatus::Temporary, 0.0, "no confident match"),
            rec("/es/hotel", "/fr/", RedirectStatus::Temporary, 0.0, "language es not migrated"),
        ]
    }

    #[test]
    fn htaccess_sections_and_grouping() {
        let h = render_htaccess(&sample());
        assert!(h.contains("# 1 permanent (301), 3 temporary (302)"));
        assert!(h.contains(
            "# same page, new slug (confidence: 0.90)\nRedirect 301 /fr/contact?x=1 /fr/nous-contacter\n"
        ));
        assert!(h.contains(
            "# Temporary fallback to /fr/ (2 URL(s))\nRedirect 302 /es/contacto /fr/\nRedirect 302 /es/hotel /fr/\n"
        ));
        let fr = h.find("fallback to /fr/").unwrap();
        let de = h.find("fallback to /de/").unwrap();
        assert!(fr < de);
        assert!(h.find("Redirect 301").unwrap() < h.find("Redirect 302").unwrap());
    }

    #[test]
    fn htaccess_quotes_paths_with_spaces() {
        let h = render_htaccess(&[rec("/fr/mon fichier", "/fr/x", RedirectStatus::Permanent, 0.8, "")]);
        assert!(h.contains("# match (confidence: 0.80)\nRedirect 301 \"/fr/mon fichier\" /fr/x"));
    }

    #[test]
    fn csv_quotes_and_tags_language() {
        let c = render_csv(&sample(), &LanguageClassifier::new("fr"));
        let lines: Vec<&str> = c.lines().collect();
        assert_eq!(lines[0], "source,target,status,confidence,reason,language");
        assert_eq!(
            lines[1],
            "https://old.example.com/fr/contact?x=1,/fr/nous-contacter,301,0.90,\"same page,"
        );
        assert!(c.contains("/es/contacto,/fr/,302,0.00,language es not migrated,es\n"));
    }

    #[test]
    fn write_all_creates_three_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("out");
        let paths = write_all(&dir, &sample(), &LanguageClassifier::new("fr")).unwrap();
        let json: Vec<RedirectRecord> =
            serde_json::from_str(&std::fs::read_to_string(&paths.json).unwrap()).unwrap();
        assert_eq!(json, sample());
        assert!(std::fs::read_to_string(&paths.htaccess)
            .unwrap()
            .starts_with("# Generated by redirmap"));
        assert!(paths.csv.exists());
    }

    #[test]
    fn source_path_keeps_relative_sources() {
        assert_eq!(source_path("/fr/a"), "/fr/a");
        assert_eq!(source_path("https://x.com"), "/");
    }
}
