use clap::{Parser, Subcommand, ValueEnum};
use sabha_core::{
    Actor, ChangeProposal, EventConfig, EventKind, FeeSchedule, RegistryEngine, RequestKind,
    StoreConfig, TargetRef,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "sabha", version, about = "Sabha registry engine CLI")]
struct Cli {
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "SABHA_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for registry persistence.
    #[arg(long, env = "SABHA_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "SABHA_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the PostgreSQL schema and exit.
    Migrate,
    /// Compute the registration fee for the given allocation counts.
    Fee {
        #[arg(long, default_value_t = 0)]
        individual: u64,
        #[arg(long, default_value_t = 0)]
        group: u64,
    },
    /// Run a scripted end-to-end scenario against the selected backend.
    Demo,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StoreConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                StoreConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StoreConfig::Memory
            }
        }
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "sabha=info,info".to_string()))
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;

    match cli.command {
        Command::Migrate => {
            if matches!(storage, StoreConfig::Memory) {
                anyhow::bail!("migrate needs a postgres backend");
            }
            let label = storage.label();
            storage.bootstrap().await?;
            info!("schema ready on {label} backend");
        }
        Command::Fee { individual, group } => {
            let schedule = FeeSchedule::default();
            println!(
                "{} individual + {} group => {}",
                individual,
                group,
                schedule.compute_fee(individual, group)
            );
        }
        Command::Demo => {
            let label = storage.label();
            let store = storage.bootstrap().await?;
            info!("running demo scenario on {label} backend");
            run_demo(RegistryEngine::new(store)).await?;
        }
    }

    Ok(())
}

/// Walk one unit through the whole flow: a change request lifecycle, an
/// individual registration, a team registration, and the fee accrual.
async fn run_demo(engine: RegistryEngine) -> anyhow::Result<()> {
    let unit = Actor::unit("unit-demo");
    let admin = Actor::admin("admin-demo");
    let unit_id = Uuid::new_v4();
    let district_id = Uuid::new_v4();

    let addition = engine
        .propose_change(
            &unit,
            ChangeProposal {
                kind: RequestKind::MemberAddition,
                target: None,
                proposed: [
                    ("name".to_string(), json!("DEMO MEMBER")),
                    ("unit_id".to_string(), json!(unit_id.to_string())),
                ]
                .into_iter()
                .collect(),
                capacity_demand: None,
                reason: "demo member enrollment".to_string(),
                proof_reference: None,
            },
        )
        .await?;
    let approved = engine.approve_change(&admin, addition.id).await?;
    let member: TargetRef = approved
        .created_target
        .ok_or_else(|| anyhow::anyhow!("approved addition did not create a member"))?;
    println!("member created: {}", member.key());

    let rename = engine
        .propose_change(
            &unit,
            ChangeProposal {
                kind: RequestKind::MemberInfoChange,
                target: Some(member),
                proposed: [("name".to_string(), json!("DEMO MEMBER (RENAMED)"))]
                    .into_iter()
                    .collect(),
                capacity_demand: None,
                reason: "demo rename to show revert".to_string(),
                proof_reference: Some("demo-proof.pdf".to_string()),
            },
        )
        .await?;
    engine.approve_change(&admin, rename.id).await?;
    engine.revert_change(&admin, rename.id).await?;
    println!("rename applied and reverted: {}", rename.id);

    let drawing = EventConfig {
        id: Uuid::new_v4(),
        name: "Cartoon Drawing".to_string(),
        kind: EventKind::Individual,
        max_allowed_limit: 100,
        per_unit_allowed_limit: 2,
    };
    let entry = engine
        .register_individual(&unit, &drawing, member.id, unit_id, district_id)
        .await?;
    println!("individual chest number: {}", entry.chest_number);

    let song = EventConfig {
        id: Uuid::new_v4(),
        name: "Group Song (Malayalam)".to_string(),
        kind: EventKind::Group,
        max_allowed_limit: 50,
        per_unit_allowed_limit: 10,
    };
    let members: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let team = engine
        .register_team(&unit, &song, "DEMO", &members, unit_id, district_id)
        .await?;
    println!("team chest number: {}", team[0].chest_number);

    let payment = engine
        .accrue_registration_payment(&unit, district_id, 1, 3, None)
        .await?;
    println!(
        "registration payment {} accrued: {}",
        payment.id, payment.computed_amount
    );

    Ok(())
}
