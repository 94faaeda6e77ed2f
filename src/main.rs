//! # Tenancy maintenance CLI
//!
//! Installs the engine into a database and runs the registry and structural
//! maintenance operations.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use tenancy::{
    Tenancy,
    classifier::SchemaGraph,
    config::ConfigLoader,
    db,
    fanout::StructuralChange,
    hooks::Hooks,
    registry::{CreateTenantRequest, TenantChanges, TenantFilter},
    telemetry::{TraceContext, init_tracing, with_trace_context},
};

#[derive(Parser)]
#[command(name = "tenancy")]
#[command(about = "Schema-per-tenant maintenance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ListFilter {
    Active,
    Inactive,
    All,
}

impl From<ListFilter> for TenantFilter {
    fn from(filter: ListFilter) -> Self {
        match filter {
            ListFilter::Active => TenantFilter::Active,
            ListFilter::Inactive => TenantFilter::Inactive,
            ListFilter::All => TenantFilter::All,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run registry migrations, install the clone routine and create the template schema
    Install,

    /// Create a tenant and its schema
    Create {
        /// Schema identifier
        schema: String,

        /// Unique display name
        #[arg(long)]
        name: String,

        /// Clone structure and rows from this schema instead of the template
        #[arg(long)]
        clone_from: Option<String>,

        /// Create the tenant inactive
        #[arg(long)]
        inactive: bool,
    },

    /// Delete a tenant and drop its schema with all data
    Delete {
        schema: String,

        /// Required: the schema and its data are not recoverable
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// List tenants
    List {
        #[arg(long, value_enum, default_value = "all")]
        filter: ListFilter,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create schemas for registry rows that have none
    Reconcile,

    /// Change a tenant's display name or active flag
    Update {
        schema: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        active: Option<bool>,
    },

    /// Authorize a principal to activate a tenant
    Grant { schema: String, principal: Uuid },

    /// Remove a principal's authorization for a tenant
    Revoke { schema: String, principal: Uuid },

    /// Show whether tables are shared or partitioned
    Classify {
        #[arg(required = true)]
        tables: Vec<String>,
    },

    /// Apply a DDL statement to the shared schema or to every tenant and the template
    ApplyDdl {
        /// The statement
        sql: String,

        /// Target tables; recognised from the statement when omitted
        #[arg(long = "table")]
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;
    tracing::debug!(profile = %config.profile, "configuration loaded");

    let pool = Arc::new(
        db::init_pool(&config)
            .await
            .context("initializing database connection pool")?,
    );

    // Install runs before the registry exists, so there is no graph to load.
    let tenancy = if matches!(cli.command, Commands::Install) {
        Tenancy::with_graph(config.tenancy.clone(), pool, SchemaGraph::new(), Hooks::new())?
    } else {
        Tenancy::connect(config.tenancy.clone(), pool, Hooks::new())
            .await
            .context("loading schema graph")?
    };

    let context = TraceContext::new();
    tracing::debug!(trace_id = %context.trace_id, "dispatching command");
    with_trace_context(context, run(&tenancy, cli.command)).await
}

async fn run(tenancy: &Tenancy, command: Commands) -> Result<()> {
    let db = tenancy.db();

    match command {
        Commands::Install => {
            tenancy.install().await.context("installing tenancy")?;
            println!(
                "Installed into shared schema '{}' with template '{}'.",
                tenancy.settings().shared_schema,
                tenancy.settings().template_schema
            );
        }
        Commands::Create {
            schema,
            name,
            clone_from,
            inactive,
        } => {
            let mut request = CreateTenantRequest::new(&schema, &name);
            request.clone_from = clone_from;
            request.is_active = !inactive;
            let tenant = tenancy.registry().create(db, request).await?;
            println!("Created tenant '{}' ({}).", tenant.schema_name, tenant.display_name);
        }
        Commands::Delete { schema, yes } => {
            if !yes {
                bail!("refusing to drop schema '{schema}' without --yes");
            }
            tenancy.registry().delete(db, &schema).await?;
            println!("Deleted tenant '{schema}'.");
        }
        Commands::List { filter, json } => {
            let tenants = tenancy.registry().list(db, filter.into()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tenants)?);
            } else {
                for tenant in tenants {
                    let state = if tenant.is_active { "active" } else { "inactive" };
                    println!("{}\t{}\t{}", tenant.schema_name, state, tenant.display_name);
                }
            }
        }
        Commands::Reconcile => {
            let created = tenancy.registry().reconcile(db).await?;
            println!("Created {} missing schema(s).", created.len());
            for schema in created {
                println!("  {schema}");
            }
        }
        Commands::Update {
            schema,
            name,
            active,
        } => {
            let changes = TenantChanges {
                schema_name: None,
                display_name: name,
                is_active: active,
            };
            let tenant = tenancy.registry().update(db, &schema, changes).await?;
            println!(
                "Updated tenant '{}' (active: {}).",
                tenant.schema_name, tenant.is_active
            );
        }
        Commands::Grant { schema, principal } => {
            tenancy.registry().grant(db, &schema, principal).await?;
            println!("Granted {principal} access to '{schema}'.");
        }
        Commands::Revoke { schema, principal } => {
            tenancy.registry().revoke(db, &schema, principal).await?;
            println!("Revoked {principal} access to '{schema}'.");
        }
        Commands::Classify { tables } => {
            for table in tables {
                println!("{table}\t{}", tenancy.classifier().classify(&table));
            }
        }
        Commands::ApplyDdl { sql, tables } => {
            let change = if tables.is_empty() {
                StructuralChange::raw(sql)
            } else {
                let tables: Vec<&str> = tables.iter().map(String::as_str).collect();
                let (kind, _) = tenancy::fanout::extract::extract(&sql);
                StructuralChange::new(kind, &tables, sql)
            };
            let report = tenancy.apply(&change).await?;
            println!(
                "Applied as {} in {} schema(s): {}",
                report.class,
                report.schemas.len(),
                report.schemas.join(", ")
            );
        }
    }

    Ok(())
}
