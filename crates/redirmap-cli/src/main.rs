use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use redirmap_core::matching::{estimate_cost, match_stats, Pricing};
use redirmap_core::{
    CachePolicy, LanguageClassifier, LanguageCoverage, LanguageTag, Pipeline, PipelineConfig,
};
use redirmap_local::inputs::{detect_domain, parse_url_list, MediaFilter, UrlCleaner};
use redirmap_local::openai_compat::OpenAiCompatMatcher;
use redirmap_local::FsCache;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "redirmap")]
#[command(
    about = "Map old-site URLs to new-site URLs for a migration (301 matches, 302 fallbacks)",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Match old URLs to new ones and write redirects.{htaccess,csv,json}.
    Generate(GenerateCmd),
    /// Language classification and coverage report (json; no network).
    Languages(LanguagesCmd),
    /// Rough token/cost estimate for a generate run (json; no network).
    Estimate(EstimateCmd),
    /// Diagnose configuration issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct InputArgs {
    /// Old-site URL list: sitemap xml, json, csv (first column) or one URL per line.
    #[arg(long)]
    old_file: Option<PathBuf>,
    /// Extra old-site URL (repeatable).
    #[arg(long = "old")]
    old: Vec<String>,
    /// New-site URL list, same formats as --old-file.
    #[arg(long)]
    new_file: Option<PathBuf>,
    /// Extra new-site URL (repeatable).
    #[arg(long = "new")]
    new: Vec<String>,
    /// Keep images, scripts, documents and other assets in the lists.
    #[arg(long)]
    keep_media: bool,
    /// Path fragment to strip from every URL, e.g. a staging prefix (repeatable).
    #[arg(long = "clean-pattern")]
    clean_patterns: Vec<String>,
    /// Extra classifier rule `tag=regex` (repeatable), e.g. `pt=/pt-br/`.
    #[arg(long = "language-rule")]
    language_rules: Vec<String>,
    /// Language assumed when no rule matches.
    #[arg(long, env = "REDIRMAP_DEFAULT_LANGUAGE", default_value = "fr")]
    default_language: String,
}

#[derive(clap::Args, Debug)]
struct GenerateCmd {
    #[command(flatten)]
    input: InputArgs,
    /// Directory for redirects.htaccess / redirects.csv / redirects.json.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
    #[arg(long, env = "REDIRMAP_CHUNK_SIZE", default_value_t = 50)]
    chunk_size: usize,
    /// Cap on new-site candidates sent with each chunk.
    #[arg(long, env = "REDIRMAP_MAX_CANDIDATES", default_value_t = 200)]
    max_candidates: usize,
    /// Minimum confidence for a 301 (inclusive).
    #[arg(long, env = "REDIRMAP_CONFIDENCE_THRESHOLD", default_value_t = 0.7)]
    threshold: f64,
    /// Retries after the first failed call per chunk.
    #[arg(long, env = "REDIRMAP_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    #[arg(long, env = "REDIRMAP_RETRY_BASE_DELAY_MS", default_value_t = 1000)]
    retry_base_delay_ms: u64,
    /// Landing language for missing-language fallbacks.
    #[arg(long, env = "REDIRMAP_FALLBACK_LANGUAGE", default_value = "fr")]
    fallback_language: String,
    /// Prefix fallback targets with this origin, e.g. https://www.example.com.
    #[arg(long, env = "REDIRMAP_TARGET_DOMAIN")]
    target_domain: Option<String>,
    /// Use the most common origin of the new URLs as --target-domain.
    #[arg(long, conflicts_with = "target_domain")]
    detect_target_domain: bool,
    /// Language served at the root of the target domain.
    #[arg(long, env = "REDIRMAP_ROOT_LANGUAGE")]
    root_language: Option<String>,
    /// Free-text project context forwarded to the matcher.
    #[arg(long, env = "REDIRMAP_BUSINESS_CONTEXT")]
    business_context: Option<String>,
    /// Read the business context from a file instead.
    #[arg(long, conflicts_with = "business_context")]
    business_context_file: Option<PathBuf>,
    #[arg(long, env = "REDIRMAP_TEMPERATURE", default_value_t = 0.1)]
    temperature: f64,
    /// Model override (else REDIRMAP_OPENAI_COMPAT_MODEL, else gpt-3.5-turbo).
    #[arg(long)]
    model: Option<String>,
    #[arg(long, env = "REDIRMAP_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Disable the match cache entirely.
    #[arg(long)]
    no_cache: bool,
    /// Ignore cached entries older than this many seconds.
    #[arg(long)]
    cache_ttl_s: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct LanguagesCmd {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long, env = "REDIRMAP_FALLBACK_LANGUAGE", default_value = "fr")]
    fallback_language: String,
}

#[derive(clap::Args, Debug)]
struct EstimateCmd {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long, env = "REDIRMAP_BUSINESS_CONTEXT")]
    business_context: Option<String>,
    /// USD per 1k input tokens.
    #[arg(long, default_value_t = 0.0015)]
    input_price: f64,
    /// USD per 1k output tokens.
    #[arg(long, default_value_t = 0.002)]
    output_price: f64,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    #[arg(long, env = "REDIRMAP_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Delete cache entries older than this many seconds before reporting.
    #[arg(long)]
    prune_older_than_s: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

struct Inputs {
    old: Vec<String>,
    new: Vec<String>,
    media_removed: usize,
    classifier: LanguageClassifier,
}

fn read_list(file: Option<&Path>, inline: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    if let Some(p) = file {
        let txt = std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?;
        out = parse_url_list(&txt).with_context(|| format!("parse {}", p.display()))?;
    }
    out.extend(inline.iter().map(|s| s.trim().to_string()));
    Ok(redirmap_local::inputs::dedup(out))
}

fn build_classifier(args: &InputArgs) -> Result<LanguageClassifier> {
    let mut classifier = LanguageClassifier::new(args.default_language.as_str());
    for rule in &args.language_rules {
        let Some((tag, pattern)) = rule.split_once('=') else {
            anyhow::bail!("--language-rule expects tag=regex, got {rule:?}");
        };
        classifier.add_rule(tag, &[pattern])?;
    }
    Ok(classifier)
}

fn load_inputs(args: &InputArgs) -> Result<Inputs> {
    let cleaner = UrlCleaner::new(args.clean_patterns.iter().cloned());
    let mut old = cleaner.clean_all(&read_list(args.old_file.as_deref(), &args.old)?);
    let mut new = cleaner.clean_all(&read_list(args.new_file.as_deref(), &args.new)?);
    let mut media_removed = 0;
    if !args.keep_media {
        let filter = MediaFilter::new();
        let (kept, media) = filter.partition(old);
        media_removed += media.len();
        old = kept;
        let (kept, media) = filter.partition(new);
        media_removed += media.len();
        new = kept;
    }
    if old.is_empty() {
        anyhow::bail!("no old URLs given (use --old-file or --old)");
    }
    Ok(Inputs {
        old: redirmap_local::inputs::dedup(old),
        new: redirmap_local::inputs::dedup(new),
        media_removed,
        classifier: build_classifier(args)?,
    })
}

fn load_env_file() {
    // Opt-in only; never overrides the process environment and never logs values.
    let Ok(p) = std::env::var("REDIRMAP_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn init_tracing() {
    // Logs go to stderr; stdout carries the JSON payload.
    let filter = tracing_subscriber::EnvFilter::try_from_env("REDIRMAP_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn generate(args: GenerateCmd) -> Result<()> {
    let inputs = load_inputs(&args.input)?;

    let business_context = match &args.business_context_file {
        Some(p) => Some(
            std::fs::read_to_string(p).with_context(|| format!("read {}", p.display()))?,
        ),
        None => args.business_context.clone(),
    };
    let target_domain = if args.detect_target_domain {
        let d = detect_domain(&inputs.new);
        if d.is_none() {
            tracing::warn!("no absolute new URLs; falling back to relative targets");
        }
        d
    } else {
        args.target_domain.clone()
    };

    let config = PipelineConfig {
        chunk_size: args.chunk_size,
        max_candidates_per_chunk: args.max_candidates,
        confidence_threshold: args.threshold,
        max_retries: args.max_retries,
        retry_base_delay_ms: args.retry_base_delay_ms,
        default_language: LanguageTag::new(&args.input.default_language),
        fallback_language: LanguageTag::new(&args.fallback_language),
        target_domain: target_domain.clone(),
        root_language: args.root_language.as_deref().map(LanguageTag::new),
        business_context,
        temperature: args.temperature,
    };

    let matcher = OpenAiCompatMatcher::from_env(args.model.clone())?;
    tracing::info!(
        base_url = matcher.client().base_url(),
        model = matcher.client().model(),
        old = inputs.old.len(),
        new = inputs.new.len(),
        "starting generate"
    );
    let mut pipeline = Pipeline::new(config, matcher)?.with_classifier(inputs.classifier.clone());
    if !args.no_cache {
        let dir = args.cache_dir.clone().unwrap_or_else(FsCache::default_dir);
        let cache = FsCache::new(dir).with_ttl(args.cache_ttl_s);
        pipeline = pipeline.with_cache(Arc::new(cache), CachePolicy::default());
    }

    let outcome = pipeline.run(&inputs.old, &inputs.new).await?;
    let files = redirmap_local::export::write_all(&args.out_dir, &outcome.records, &inputs.classifier)?;

    let all_failed =
        !outcome.failures.is_empty() && outcome.failures.len() == outcome.languages_processed.len();
    let summary = serde_json::json!({
        "schema_version": 1,
        "kind": "generate",
        "ok": !all_failed,
        "old_urls": inputs.old.len(),
        "new_urls": inputs.new.len(),
        "media_removed": inputs.media_removed,
        "target_domain": target_domain,
        "records": outcome.records.len(),
        "permanent": outcome.permanent_count(),
        "temporary": outcome.temporary_count(),
        "unmatched": outcome.unmatched.len(),
        "missing_languages": outcome.missing_languages,
        "languages_processed": outcome.languages_processed,
        "languages_cached": outcome.languages_cached,
        "failures": outcome.failures,
        "ambiguous": outcome.ambiguous,
        "match_stats": match_stats(&outcome.matches),
        "files": files,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if all_failed {
        anyhow::bail!("matching failed for every language; only fallbacks were written");
    }
    Ok(())
}

fn languages(args: LanguagesCmd) -> Result<()> {
    let inputs = load_inputs(&args.input)?;
    let c = &inputs.classifier;
    let coverage = LanguageCoverage::compute(
        &c.group_by_language(&inputs.old),
        &c.group_by_language(&inputs.new),
        &LanguageTag::new(&args.fallback_language),
    );
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "languages",
        "ok": true,
        "supported": c.supported_languages(),
        "default_language": c.default_language(),
        "old": c.language_stats(&inputs.old),
        "new": c.language_stats(&inputs.new),
        "missing_languages": c.missing_languages(&inputs.old, &inputs.new),
        "coverage": coverage,
    });
    println!("{}", serde_json::to_string_pretty(&v)?);
    Ok(())
}

fn estimate(args: EstimateCmd) -> Result<()> {
    let inputs = load_inputs(&args.input)?;
    let pricing = Pricing {
        input_per_1k: args.input_price,
        output_per_1k: args.output_price,
    };
    let est = estimate_cost(
        &inputs.old,
        &inputs.new,
        args.business_context.as_deref().unwrap_or(""),
        pricing,
    );
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "estimate",
        "ok": true,
        "old_urls": inputs.old.len(),
        "new_urls": inputs.new.len(),
        "pricing": pricing,
        "estimate": est,
    });
    println!("{}", serde_json::to_string_pretty(&v)?);
    Ok(())
}

fn doctor(args: DoctorCmd) -> Result<()> {
    fn has_env(k: &str) -> bool {
        std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
    }

    // Presence only; values are never printed.
    let base_url_set = has_env("REDIRMAP_OPENAI_COMPAT_BASE_URL");
    let key_set = has_env("REDIRMAP_OPENAI_COMPAT_API_KEY") || has_env("OPENAI_API_KEY");
    let llm_ok = base_url_set || key_set;

    let cache_dir = args.cache_dir.unwrap_or_else(FsCache::default_dir);
    let cache_ok = (|| -> anyhow::Result<()> {
        std::fs::create_dir_all(&cache_dir)?;
        let probe = cache_dir.join(format!("redirmap-doctor-{}.probe", std::process::id()));
        std::fs::write(&probe, b"ok")?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    })()
    .is_ok();

    let cache = FsCache::new(cache_dir.clone());
    let pruned = match args.prune_older_than_s {
        Some(age) => Some(cache.prune(age)?),
        None => None,
    };
    let stats = cache.stats().unwrap_or_default();

    let checks = vec![
        serde_json::json!({
            "name": "llm_configured",
            "ok": llm_ok,
            "message": if llm_ok { "matching endpoint is configured" } else { "no matching endpoint configured" },
            "hint": if llm_ok { "" } else { "Set REDIRMAP_OPENAI_COMPAT_API_KEY (or OPENAI_API_KEY), or REDIRMAP_OPENAI_COMPAT_BASE_URL for a local gateway." },
        }),
        serde_json::json!({
            "name": "cache_dir_writable",
            "ok": cache_ok,
            "message": if cache_ok { "cache dir is writable" } else { "cache dir is not writable" },
            "hint": if cache_ok { "" } else { "Set REDIRMAP_CACHE_DIR to a writable directory or pass --no-cache." },
        }),
    ];
    let ok = llm_ok && cache_ok;

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("redirmap {}", env!("CARGO_PKG_VERSION"));
            println!("checks:");
            for c in &checks {
                let name = c["name"].as_str().unwrap_or_default();
                let pass = c["ok"].as_bool().unwrap_or(false);
                println!("- {}: {}", name, if pass { "ok" } else { "fail" });
            }
            println!("cache: {} entries, {} bytes", stats.entries, stats.bytes);
            if let Some(n) = pruned {
                println!("pruned: {n}");
            }
        }
        _ => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": ok,
                "name": "redirmap",
                "version": env!("CARGO_PKG_VERSION"),
                "cache_dir": cache_dir,
                "cache": stats,
                "pruned": pruned,
                "checks": checks,
            });
            println!("{}", v);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Generate(args) => generate(args).await?,
        Commands::Languages(args) => languages(args)?,
        Commands::Estimate(args) => estimate(args)?,
        Commands::Doctor(args) => doctor(args)?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "redirmap",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("redirmap {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{}", v),
            }
        }
    }
    Ok(())
}
