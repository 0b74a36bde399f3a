use std::sync::Arc;

use anyhow::Context;

use mail_triage::agent::builtin::REGISTRARS;
use mail_triage::agent::{AgentDeps, AgentRegistry};
use mail_triage::config::{Settings, TriageConfig, api_key_from_env};
use mail_triage::knowledge::{DirKnowledgeStore, KnowledgeStore, PromptKnowledge};
use mail_triage::llm::{AnthropicGenerator, QuotaRetryPolicy};
use mail_triage::mailbox::LibSqlMailbox;
use mail_triage::notify::{LogNotifier, NotificationSink, SmtpConfig, SmtpNotifier, WebhookNotifier};
use mail_triage::pipeline::{TriageRunner, spawn_periodic};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = TriageConfig::from_env().context("invalid configuration")?;
    let api_key = api_key_from_env().context("export ANTHROPIC_API_KEY=sk-ant-...")?;

    eprintln!("📬 mail-triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Label prefix: {}", config.label_prefix);
    if config.dry_run {
        eprintln!("   DRY RUN: no labels, drafts, forwards or notifications");
    }

    // ── Collaborators ───────────────────────────────────────────────────
    let mailbox = Arc::new(
        LibSqlMailbox::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open mailbox at {}", config.db_path.display()))?,
    );

    let generator = Arc::new(AnthropicGenerator::new(&api_key)?);

    let notifier: Arc<dyn NotificationSink> = match std::env::var("TRIAGE_WEBHOOK_URL") {
        Ok(url) => Arc::new(WebhookNotifier::new(url)?),
        Err(_) => match SmtpConfig::from_env()? {
            Some(smtp) => Arc::new(SmtpNotifier::new(smtp)),
            None => Arc::new(LogNotifier),
        },
    };
    eprintln!("   Notifications: {}", notifier.name());

    let knowledge: Option<Arc<dyn KnowledgeStore>> = config
        .knowledge
        .root
        .clone()
        .map(|root| Arc::new(DirKnowledgeStore::new(root)) as Arc<dyn KnowledgeStore>);

    // ── Agents ──────────────────────────────────────────────────────────
    let settings = Settings::from_env();
    let registry = Arc::new(
        AgentRegistry::from_registrars(REGISTRARS, &settings)
            .context("agent registration failed")?,
    );
    for registration in registry.iter() {
        eprintln!(
            "   Agent: {} → {}{}",
            registration.name,
            registration.label,
            if registration.is_enabled(&settings) { "" } else { " (disabled)" }
        );
    }

    let deps = AgentDeps {
        mailbox,
        generator,
        notifier,
        reply_knowledge: PromptKnowledge::none(),
        model: config.model.clone(),
        retry: QuotaRetryPolicy::new(config.max_retries),
        label_prefix: config.label_prefix.clone(),
    };

    let interval = config.interval;
    let runner = Arc::new(TriageRunner::new(config, registry, deps, knowledge));

    // ── Run ─────────────────────────────────────────────────────────────
    match interval {
        None => {
            let report = runner.run_once(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(every) => {
            eprintln!("   Running every {}s. Ctrl-C to stop.\n", every.as_secs());
            let (handle, shutdown) = spawn_periodic(runner, every);
            tokio::signal::ctrl_c().await?;
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
            handle.abort();
            eprintln!("Shutting down");
        }
    }

    Ok(())
}
