//! WABulk 操作员控制台
//!
//! 用法：`wabulk <recipients.json> [--dry-run] [--config <path>]`
//!
//! recipients.json 可以是收件人数组，也可以是 `{"recipients": [...], "options": {...}}`。
//! 事件逐行以 JSON 打印到 stdout；stdin 接受 pause / resume / stop / status / quit（停止所有活动），
//! 或一行 JSON 控制请求（如 `{"action":"getActiveCampaign"}`）。Ctrl+C 停止所有活动。
//! --dry-run 使用内存模拟的会话后端，不需要浏览器。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use wabulk::config::{load_config, AppConfig};
use wabulk::core::{
    run_until_shutdown, CampaignEvent, CampaignId, CampaignOptions, ControlResponse, ControlSurface,
    Orchestrator, RecipientInput, ShutdownManager, ShutdownReason,
};
use wabulk::session::mock::{MockBackend, MockSurface};
use wabulk::session::SessionBackend;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CampaignFile {
    Full {
        recipients: Vec<RecipientInput>,
        #[serde(default)]
        options: CampaignOptions,
    },
    List(Vec<RecipientInput>),
}

struct Args {
    recipients: PathBuf,
    dry_run: bool,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut recipients = None;
    let mut dry_run = false;
    let mut config = None;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--config" => config = Some(PathBuf::from(it.next().context("--config needs a path")?)),
            "-h" | "--help" => bail!("usage: wabulk <recipients.json> [--dry-run] [--config <path>]"),
            other if recipients.is_none() => recipients = Some(PathBuf::from(other)),
            other => bail!("unexpected argument: {}", other),
        }
    }
    Ok(Args {
        recipients: recipients.context("usage: wabulk <recipients.json> [--dry-run] [--config <path>]")?,
        dry_run,
        config,
    })
}

fn backend(cfg: &AppConfig, dry_run: bool) -> anyhow::Result<Arc<dyn SessionBackend>> {
    if dry_run {
        tracing::info!("Dry run: using in-memory session backend");
        return Ok(Arc::new(MockBackend::new(Arc::new(MockSurface::whatsapp()))));
    }
    launch_browser(cfg)
}

#[cfg(feature = "browser")]
fn launch_browser(cfg: &AppConfig) -> anyhow::Result<Arc<dyn SessionBackend>> {
    let chrome = wabulk::browser::ChromeBackend::launch(&cfg.browser).context("Failed to launch Chrome")?;
    Ok(Arc::new(chrome))
}

#[cfg(not(feature = "browser"))]
fn launch_browser(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn SessionBackend>> {
    bail!("built without the \"browser\" feature; rebuild with --features browser or pass --dry-run")
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!(error = %e, "failed to serialize output"),
    }
}

/// 打印事件，直到本活动的最终状态出现
async fn print_events(
    id: CampaignId,
    mut observer: mpsc::UnboundedReceiver<CampaignEvent>,
    mut runtime: broadcast::Receiver<CampaignEvent>,
) {
    loop {
        let event = tokio::select! {
            Some(ev) = observer.recv() => ev,
            res = runtime.recv() => match res {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event output lagged by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        };
        print_json(&event);
        if matches!(event, CampaignEvent::Status { id: got, .. } if got == id) {
            return;
        }
    }
}

/// stdin 命令；quit 等同于 Ctrl+C，停止所有活动后退出
async fn console(control: ControlSurface, id: CampaignId, shutdown: Arc<ShutdownManager>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let response = match line {
            "" => continue,
            "pause" => control.pause().await,
            "resume" => control.resume().await,
            "stop" => control.stop().await,
            "quit" => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                return;
            }
            "status" => {
                match control.orchestrator().store().snapshot(id).await {
                    Some(snapshot) => print_json(&snapshot),
                    None => print_json(&ControlResponse::err("campaign not found")),
                }
                continue;
            }
            raw if raw.starts_with('{') => control.handle_json(raw).await,
            other => ControlResponse::err(format!("unknown command: {}", other)),
        };
        print_json(&response);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wabulk::observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let raw = std::fs::read_to_string(&args.recipients)
        .with_context(|| format!("Failed to read {}", args.recipients.display()))?;
    let (recipients, options) = match serde_json::from_str::<CampaignFile>(&raw).context("Invalid recipients file")? {
        CampaignFile::Full { recipients, options } => (recipients, options),
        CampaignFile::List(recipients) => (recipients, CampaignOptions::default()),
    };

    let orchestrator = Orchestrator::new(backend(&cfg, args.dry_run)?, &cfg);
    let control = ControlSurface::new(orchestrator.clone(), cfg.campaign.default_country_code.clone());

    let runtime_rx = orchestrator.subscribe();
    let started = control.start(recipients, options).await;
    let id = match (started.ok, started.id) {
        (true, Some(id)) => id,
        _ => bail!(
            "Campaign not started: {}",
            started.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    };
    print_json(&started);

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator.attach(id, tx).await.context("Failed to attach observer")?;

    let shutdown = Arc::new(ShutdownManager::new());
    tokio::spawn(console(control, id, shutdown.clone()));

    run_until_shutdown(
        shutdown,
        orchestrator.clone(),
        Duration::from_secs(10),
        print_events(id, rx, runtime_rx),
    )
    .await;

    if let Some(snapshot) = orchestrator.store().snapshot(id).await {
        tracing::info!(
            campaign_id = %id,
            status = %snapshot.status,
            sent = snapshot.sent,
            failed = snapshot.failed,
            total = snapshot.total,
            "campaign summary"
        );
    }
    Ok(())
}
