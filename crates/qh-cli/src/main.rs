use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use qh_schemas::{
    CreateEntityRequest, EntityName, HoldingKey, Limit, Provision, ReleaseEntityRequest,
    ReleaseHoldingRequest, SetLimitsRequest,
};

#[derive(Parser)]
#[command(name = "qh")]
#[command(about = "Quota holder CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Entity tree commands
    Entity {
        #[command(subcommand)]
        cmd: EntityCmd,
    },

    /// Limits policy commands
    Limits {
        #[command(subcommand)]
        cmd: LimitsCmd,
    },

    /// Holding commands
    Holding {
        #[command(subcommand)]
        cmd: HoldingCmd,
    },

    /// Commission commands
    Commission {
        #[command(subcommand)]
        cmd: CommissionCmd,
    },

    /// Timeline commands
    Timeline {
        #[command(subcommand)]
        cmd: TimelineCmd,
    },

    /// Run one reconcile pass and print the report
    Reconcile {
        /// A pending commission older than this is overdue
        #[arg(long, default_value_t = 3600)]
        age_threshold_secs: i64,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    /// Apply SQL migrations
    Migrate,
}

#[derive(Subcommand)]
enum EntityCmd {
    /// Create an entity under its parent
    Create {
        /// Full name, e.g. system/org/team
        #[arg(long)]
        entity: String,
        /// Key of the new entity
        #[arg(long)]
        key: String,
        /// Key of the parent entity (empty for children of the root)
        #[arg(long, default_value = "")]
        parent_key: String,
    },
    /// Release an entity (requires no children and no holdings)
    Release {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        key: String,
    },
    /// Rotate an entity's key
    SetKey {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        old_key: String,
        #[arg(long)]
        new_key: String,
    },
    /// Print one entity row
    Show {
        #[arg(long)]
        entity: String,
    },
}

#[derive(Subcommand)]
enum LimitsCmd {
    /// Install or update a named policy
    Set {
        #[arg(long)]
        policy: String,
        /// Initial quantity for holdings bound to this policy
        #[arg(long, default_value_t = 0)]
        quantity: i64,
        #[arg(long)]
        capacity: i64,
        #[arg(long)]
        import_limit: i64,
        #[arg(long)]
        export_limit: i64,
    },
    /// Print policies by name
    Get {
        #[arg(required = true)]
        policies: Vec<String>,
    },
}

#[derive(Subcommand)]
enum HoldingCmd {
    /// Print one holding snapshot
    Get {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        resource: String,
    },
    /// Release a holding (requires no pending commission on it)
    Release {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        resource: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
enum CommissionCmd {
    /// Issue a commission over one or more provisions
    Issue {
        /// Caller service identity, e.g. compute
        #[arg(long)]
        caller: String,
        /// Caller-side transaction key (idempotency)
        #[arg(long)]
        client_key: String,
        /// Provision as entity:resource:delta, repeatable
        #[arg(long = "provision", required = true)]
        provisions: Vec<String>,
    },
    /// Accept a pending commission (debits stay)
    Accept {
        #[arg(long)]
        serial: i64,
    },
    /// Reject a pending commission (debits reversed)
    Reject {
        #[arg(long)]
        serial: i64,
    },
    /// Print one commission with its provisions
    Show {
        #[arg(long)]
        serial: i64,
    },
    /// List pending serials, optionally scoped to a subtree
    Pending {
        #[arg(long)]
        entity: Option<String>,
    },
}

#[derive(Subcommand)]
enum TimelineCmd {
    /// Print one pair's timeline as JSON lines
    Get {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        resource: String,
    },
    /// Verify one pair's hash chain
    Verify {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        resource: String,
    },
    /// Delete timeline entries older than the retention window
    Prune {
        #[arg(long)]
        retention_days: i64,
    },
}

/// Parse "entity:resource:delta". The entity may contain '/', never ':'.
fn parse_provision(raw: &str) -> Result<Provision> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 3 {
        anyhow::bail!("invalid provision {raw:?}; expected entity:resource:delta");
    }
    let entity = EntityName::parse(parts[0])?;
    let delta: i64 = parts[2]
        .parse()
        .with_context(|| format!("invalid delta in provision {raw:?}"))?;
    Ok(Provision::new(entity, parts[1], delta))
}

fn print_rejected<T: serde::Serialize>(rejected: &[qh_schemas::Rejected<T>]) -> Result<()> {
    for r in rejected {
        println!("rejected={}", serde_json::to_string(r)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = qh_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_schema={} pending_commissions={}",
                        s.ok, s.has_entities_table, s.pending_commissions
                    );
                }
                DbCmd::Migrate => {
                    qh_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = qh_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Entity { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            match cmd {
                EntityCmd::Create {
                    entity,
                    key,
                    parent_key,
                } => {
                    let entity = EntityName::parse(&entity)?;
                    let rejected = qh_db::create_entities(
                        &pool,
                        &[CreateEntityRequest {
                            entity: entity.clone(),
                            key,
                            parent_key,
                        }],
                    )
                    .await?;
                    print_rejected(&rejected)?;
                    if rejected.is_empty() {
                        println!("created=true entity={entity}");
                    }
                }
                EntityCmd::Release { entity, key } => {
                    let entity = EntityName::parse(&entity)?;
                    let rejected = qh_db::release_entities(
                        &pool,
                        &[ReleaseEntityRequest {
                            entity: entity.clone(),
                            key,
                        }],
                    )
                    .await?;
                    print_rejected(&rejected)?;
                    if rejected.is_empty() {
                        println!("released=true entity={entity}");
                    }
                }
                EntityCmd::SetKey {
                    entity,
                    old_key,
                    new_key,
                } => {
                    let entity = EntityName::parse(&entity)?;
                    qh_db::set_entity_key(&pool, &entity, &old_key, &new_key).await?;
                    println!("key_rotated=true entity={entity}");
                }
                EntityCmd::Show { entity } => {
                    let entity = EntityName::parse(&entity)?;
                    match qh_db::resolve_entity(&pool, &entity).await? {
                        Some(row) => println!(
                            "entity={} parent={} created_at={}",
                            row.full_name,
                            row.parent_name.as_deref().unwrap_or("-"),
                            row.created_at
                        ),
                        None => println!("entity={entity} found=false"),
                    }
                }
            }
        }

        Commands::Limits { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            match cmd {
                LimitsCmd::Set {
                    policy,
                    quantity,
                    capacity,
                    import_limit,
                    export_limit,
                } => {
                    let rejected = qh_db::set_limits(
                        &pool,
                        &[SetLimitsRequest {
                            policy: policy.clone(),
                            limit: Limit {
                                quantity,
                                capacity,
                                import_limit,
                                export_limit,
                            },
                        }],
                    )
                    .await?;
                    print_rejected(&rejected)?;
                    if rejected.is_empty() {
                        println!("policy_set=true policy={policy} capacity={capacity}");
                    }
                }
                LimitsCmd::Get { policies } => {
                    let (found, rejected) = qh_db::get_limits(&pool, &policies).await?;
                    for p in &found {
                        println!("{}", serde_json::to_string(p)?);
                    }
                    print_rejected(&rejected)?;
                }
            }
        }

        Commands::Holding { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            match cmd {
                HoldingCmd::Get { entity, resource } => {
                    let entity = EntityName::parse(&entity)?;
                    let (found, rejected) = qh_db::get_holdings(
                        &pool,
                        &[HoldingKey {
                            entity,
                            resource,
                        }],
                    )
                    .await?;
                    for h in &found {
                        println!("{}", serde_json::to_string(h)?);
                    }
                    print_rejected(&rejected)?;
                }
                HoldingCmd::Release {
                    entity,
                    resource,
                    key,
                } => {
                    let entity = EntityName::parse(&entity)?;
                    let rejected = qh_db::release_holdings(
                        &pool,
                        &[ReleaseHoldingRequest {
                            entity: entity.clone(),
                            resource: resource.clone(),
                            key,
                        }],
                    )
                    .await?;
                    print_rejected(&rejected)?;
                    if rejected.is_empty() {
                        println!("released=true entity={entity} resource={resource}");
                    }
                }
            }
        }

        Commands::Commission { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            let opts = qh_db::TxOptions::default();
            match cmd {
                CommissionCmd::Issue {
                    caller,
                    client_key,
                    provisions,
                } => {
                    let parsed: Vec<Provision> = provisions
                        .iter()
                        .map(|s| parse_provision(s))
                        .collect::<Result<_>>()?;
                    let outcome =
                        qh_db::issue_commission(&pool, opts, &caller, &client_key, &parsed).await?;
                    println!("{}", serde_json::to_string(&outcome)?);
                }
                CommissionCmd::Accept { serial } => {
                    let state = qh_db::accept_commission(&pool, opts, serial).await?;
                    println!("serial={serial} state={}", state.as_str());
                }
                CommissionCmd::Reject { serial } => {
                    let state = qh_db::reject_commission(&pool, opts, serial).await?;
                    println!("serial={serial} state={}", state.as_str());
                }
                CommissionCmd::Show { serial } => match qh_db::fetch_commission(&pool, serial)
                    .await?
                {
                    Some(c) => {
                        println!(
                            "serial={} caller_id={} client_key={} state={} quarantined={}",
                            c.serial,
                            c.caller_id,
                            c.client_key,
                            c.state.as_str(),
                            c.quarantined
                        );
                        for p in &c.provisions {
                            println!("provision={}", serde_json::to_string(p)?);
                        }
                    }
                    None => println!("serial={serial} found=false"),
                },
                CommissionCmd::Pending { entity } => {
                    let scope = entity.as_deref().map(EntityName::parse).transpose()?;
                    let serials = qh_db::get_pending_commissions(&pool, scope.as_ref()).await?;
                    for s in serials {
                        println!("pending={s}");
                    }
                }
            }
        }

        Commands::Timeline { cmd } => {
            let pool = qh_db::connect_from_env().await?;
            match cmd {
                TimelineCmd::Get { entity, resource } => {
                    let entity = EntityName::parse(&entity)?;
                    let entries =
                        qh_db::get_timeline(&pool, &entity, &resource, None, None).await?;
                    for e in &entries {
                        println!("{}", serde_json::to_string(e)?);
                    }
                }
                TimelineCmd::Verify { entity, resource } => {
                    let entity = EntityName::parse(&entity)?;
                    match qh_db::verify_timeline(&pool, &entity, &resource).await? {
                        qh_audit::VerifyResult::Valid { entries } => {
                            println!("valid=true entries={entries}");
                        }
                        qh_audit::VerifyResult::Broken { id, reason } => {
                            println!("valid=false broken_id={id} reason={reason}");
                        }
                    }
                }
                TimelineCmd::Prune { retention_days } => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
                    let removed = qh_db::prune_timeline(&pool, cutoff).await?;
                    println!("pruned={removed} cutoff={cutoff}");
                }
            }
        }

        Commands::Reconcile { age_threshold_secs } => {
            let pool = qh_db::connect_from_env().await?;
            let rows = qh_db::pending_rows(&pool).await?;
            let pending: Vec<qh_reconcile::PendingCommission> = rows
                .into_iter()
                .map(|r| qh_reconcile::PendingCommission {
                    serial: r.serial,
                    caller_id: r.caller_id,
                    client_key: r.client_key,
                    created_at: r.created_at,
                    quarantined: r.quarantined,
                })
                .collect();

            let report = qh_reconcile::plan(
                &pending,
                chrono::Utc::now(),
                chrono::Duration::seconds(age_threshold_secs),
                &qh_reconcile::NeverConfirm,
            );

            let items: Vec<(i64, qh_engine::Resolution)> = report
                .actions
                .iter()
                .map(|a| match a {
                    qh_reconcile::ReconcileAction::Accept { serial } => {
                        (*serial, qh_engine::Resolution::Accept)
                    }
                    qh_reconcile::ReconcileAction::Reject { serial } => {
                        (*serial, qh_engine::Resolution::Reject)
                    }
                })
                .collect();
            if !items.is_empty() {
                let results =
                    qh_db::resolve_pending_commissions(&pool, qh_db::TxOptions::default(), &items)
                        .await?;
                for r in &results {
                    println!("resolved={}", serde_json::to_string(r)?);
                }
            }

            println!("{}", serde_json::to_string(&report)?);
        }
    }

    Ok(())
}
