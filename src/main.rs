use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;

use job_tracker::config::AppConfig;
use job_tracker::llm::create_provider;
use job_tracker::mail::MailDirSource;
use job_tracker::pipeline::{
    ApplicationMatcher, EmailPipeline, Extractor, LlmFallbackExtractor, SyncRegistry, SyncRunner,
    spawn_retry_loop,
};
use job_tracker::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let watch = std::env::args().skip(1).any(|arg| arg == "--watch");
    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 Job Tracker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   User: {}", config.user_id);
    eprintln!("   Inbox: {}", config.inbox_dir.display());
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Extraction ───────────────────────────────────────────────────────
    let mut extractor = Extractor::new(config.extractor.clone());
    match &config.llm {
        Some(llm_config) => {
            let llm = create_provider(llm_config)?;
            eprintln!("   Fallback: {}", llm_config.model);
            extractor = extractor.with_fallback(Arc::new(LlmFallbackExtractor::new(
                llm,
                config.extractor.clone(),
            )));
        }
        None => eprintln!("   Fallback: disabled (no API key)"),
    }
    eprintln!();

    let pipeline = Arc::new(EmailPipeline::new(
        Arc::clone(&db),
        extractor,
        ApplicationMatcher::new(config.matcher.clone()),
    ));
    let runner = Arc::new(SyncRunner::new(
        pipeline,
        SyncRegistry::new(),
        config.pipeline.clone(),
    ));

    // Ctrl-C stops the batch between emails.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    // ── Sync ─────────────────────────────────────────────────────────────
    let source = MailDirSource::new(config.inbox_dir.clone());
    let report = runner.run_sync(&config.user_id, &source, &cancel).await?;
    let retried = runner.retry_failed().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if retried.fetched > 0 {
        println!(
            "Retried {} failed emails, {} recovered",
            retried.fetched, retried.processed
        );
    }
    let stats = db.processing_stats(&config.user_id).await?;
    println!(
        "{} emails ({} processed, {} pending), {} applications, {} awaiting review",
        stats.total_emails,
        stats.processed_emails,
        stats.pending_emails,
        stats.total_applications,
        stats.pending_review
    );

    if watch && !cancel.load(Ordering::Relaxed) {
        let (handle, shutdown) = spawn_retry_loop(Arc::clone(&runner));
        eprintln!("   Retrying failed emails in the background. Ctrl-C to exit.");
        tokio::signal::ctrl_c().await?;
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();
    }

    Ok(())
}
