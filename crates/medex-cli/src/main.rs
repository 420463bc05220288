use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

mod seed;
mod simulate;

use medex_api::types::{
    ApprovalDecisionDto, ApprovalRequestDto, CreateSessionDto, FreezeDto, SwitchProfileDto,
};
use medex_api::{AppConfig, AppState};
use medex_core::domain::Actor;

/// Medex CLI - operator and development tool for the learning engine
#[derive(Parser)]
#[command(name = "medex")]
#[command(about = "Medex engine operations CLI", long_about = None)]
struct Cli {
    /// Database URL (overrides MEDEX_DATABASE_URL)
    #[arg(short, long)]
    database: Option<String>,

    /// Acting admin user id
    #[arg(long)]
    admin_id: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runtime control plane: status, switches, freeze
    Runtime {
        #[command(subcommand)]
        command: RuntimeCommands,
    },
    /// Two-person approval workflow
    Approvals {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Recompute jobs
    Recompute {
        #[command(subcommand)]
        command: RecomputeCommands,
    },
    /// Seed demo content into an empty database
    Seed {
        /// Items per theme
        #[arg(long, default_value_t = 20)]
        per_theme: usize,
    },
    /// Simulate a learner session end to end (dev tool)
    Simulate {
        /// Learner id (random when omitted)
        #[arg(long)]
        user_id: Option<Uuid>,
        /// Question count
        #[arg(long, default_value_t = 10)]
        count: usize,
        /// Session mode
        #[arg(long, default_value = "TUTOR")]
        mode: String,
        /// Probability of answering correctly
        #[arg(long, default_value_t = 0.7)]
        accuracy: f64,
    },
}

#[derive(Subcommand)]
enum RuntimeCommands {
    /// Show the current runtime configuration
    Status,
    /// Switch profile and/or overrides
    Switch {
        /// Target profile (V1_PRIMARY or V0_FALLBACK)
        profile: String,
        /// Reason for the change
        #[arg(long)]
        reason: String,
        /// Exact confirmation phrase
        #[arg(long)]
        confirm: String,
        /// Module overrides as module=version pairs
        #[arg(long)]
        set: Vec<String>,
    },
    /// Freeze all knowledge-state updates
    Freeze {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        confirm: String,
    },
    /// Unfreeze knowledge-state updates
    Unfreeze {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        confirm: String,
    },
}

#[derive(Subcommand)]
enum ApprovalCommands {
    /// List pending approval requests
    List,
    /// File an approval request for a high-risk action
    Request {
        /// Action type, e.g. PROFILE_SWITCH_FALLBACK
        action: String,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        confirm: String,
        /// Optional JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    /// Approve a pending request (second admin)
    Approve {
        request_id: Uuid,
        #[arg(long)]
        confirm: String,
    },
    /// Reject a pending request
    Reject { request_id: Uuid },
}

#[derive(Subcommand)]
enum RecomputeCommands {
    /// Recompute mastery for a learner
    Mastery {
        user_id: Uuid,
        /// Restrict to these themes
        #[arg(long)]
        themes: Vec<i64>,
    },
    /// Recenter item Elo ratings
    Recenter,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let config = match cli.database {
        Some(database_url) => AppConfig {
            database_url,
            env: std::env::var("MEDEX_ENV").unwrap_or_else(|_| "dev".to_string()),
            exam_mode: false,
        },
        None => AppConfig::from_env()?,
    };
    let app = AppState::connect(&config.database_url, config.is_production(), config.exam_mode)
        .await?;
    let admin = Actor::admin(cli.admin_id.unwrap_or_else(Uuid::new_v4));

    match cli.command {
        Commands::Runtime { command } => runtime_command(&app, admin, command).await?,
        Commands::Approvals { command } => approval_command(&app, admin, command).await?,
        Commands::Recompute { command } => recompute_command(&app, admin, command).await?,
        Commands::Seed { per_theme } => {
            let seeded = seed::seed_demo_bank(&app, per_theme).await?;
            println!("seeded {seeded} published items");
        }
        Commands::Simulate {
            user_id,
            count,
            mode,
            accuracy,
        } => {
            let learner = Actor::student(user_id.unwrap_or_else(Uuid::new_v4));
            let request = CreateSessionDto {
                mode,
                year: 1,
                blocks: vec![1],
                themes: None,
                count,
                duration_seconds: None,
                difficulty: None,
                cognitive: None,
            };
            simulate::run_session(&app, learner, request, accuracy).await?;
        }
    }

    // Surface anything the engine audited during this invocation.
    for event in app.audit.drain() {
        tracing::info!(action = %event.action, request_id = %event.request_id, "audit");
    }

    Ok(())
}

async fn runtime_command(app: &AppState, admin: Actor, command: RuntimeCommands) -> Result<()> {
    match command {
        RuntimeCommands::Status => {
            let status = app.runtime_status(admin).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        RuntimeCommands::Switch {
            profile,
            reason,
            confirm,
            set,
        } => {
            let mut overrides = std::collections::BTreeMap::new();
            for pair in set {
                let (module, version) = pair.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("override must be module=version, got {pair:?}")
                })?;
                overrides.insert(module.to_string(), version.to_string());
            }
            let status = app
                .switch_profile(
                    admin,
                    SwitchProfileDto {
                        profile,
                        overrides: Some(overrides),
                        reason,
                        confirmation_phrase: Some(confirm),
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        RuntimeCommands::Freeze { reason, confirm } => {
            let status = app
                .freeze_updates(
                    admin,
                    FreezeDto {
                        reason,
                        confirmation_phrase: Some(confirm),
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        RuntimeCommands::Unfreeze { reason, confirm } => {
            let status = app
                .unfreeze_updates(
                    admin,
                    FreezeDto {
                        reason,
                        confirmation_phrase: Some(confirm),
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}

async fn approval_command(app: &AppState, admin: Actor, command: ApprovalCommands) -> Result<()> {
    match command {
        ApprovalCommands::List => {
            let pending = app.list_pending_approvals(admin).await?;
            println!("{}", serde_json::to_string_pretty(&pending)?);
        }
        ApprovalCommands::Request {
            action,
            reason,
            confirm,
            payload,
        } => {
            let payload = payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or(serde_json::Value::Null);
            let approval = app
                .request_approval(
                    admin,
                    ApprovalRequestDto {
                        action_type: action,
                        payload: Some(payload),
                        reason,
                        confirmation_phrase: confirm,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
        ApprovalCommands::Approve {
            request_id,
            confirm,
        } => {
            let approval = app
                .approve(
                    admin,
                    ApprovalDecisionDto {
                        request_id,
                        confirmation_phrase: Some(confirm),
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
        ApprovalCommands::Reject { request_id } => {
            let approval = app
                .reject(
                    admin,
                    ApprovalDecisionDto {
                        request_id,
                        confirmation_phrase: None,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&approval)?);
        }
    }
    Ok(())
}

async fn recompute_command(
    app: &AppState,
    admin: Actor,
    command: RecomputeCommands,
) -> Result<()> {
    match command {
        RecomputeCommands::Mastery { user_id, themes } => {
            let theme_filter = if themes.is_empty() {
                None
            } else {
                Some(themes)
            };
            let output = app.recompute_mastery(admin, user_id, theme_filter).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        RecomputeCommands::Recenter => {
            let output = app.recenter_ratings(admin).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}
