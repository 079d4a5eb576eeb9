//! Operator command line.
//!
//! The CLI talks to the store directly with operator (unscoped) access;
//! the scoped surface is the HTTP API started by `serve`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;

use crate::api::http::run_http_server;
use crate::config::schema::NetworkConfig;
use crate::error::{NetworkError, Result};
use crate::graph::cycle::CycleGuard;
use crate::graph::leader::LeaderResolver;
use crate::graph::store::HierarchyStore;
use crate::graph::traversal::NetworkResolver;
use crate::graph::tree::TreeBuilder;
use crate::network::NetworkService;
use crate::types::{EdgeRole, Role, UserId};

#[derive(Debug, Parser)]
#[command(name = "church-network")]
#[command(about = "Discipleship hierarchy and network resolution service")]
#[command(version)]
pub struct Cli {
    /// Explicit configuration file (merged over user and project config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database path (overrides every config source)
    #[arg(long, global = true)]
    pub db: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create the database and schema if missing
    Init,
    /// Run the HTTP API
    Serve {
        /// Listen address, e.g. 0.0.0.0:8080
        #[arg(long)]
        addr: Option<String>,
    },
    /// Print a user's discipleship tree
    Tree {
        user: UserId,
        /// Emit JSON instead of the text rendering
        #[arg(long)]
        json: bool,
    },
    /// List every user below a given user
    Descendants {
        user: UserId,
        /// Only follow edges of this kind
        #[arg(long)]
        role: Option<String>,
    },
    /// Set a user's parent (cycle-checked)
    Assign {
        child: UserId,
        parent: UserId,
        #[arg(long, default_value = "disciple")]
        role: String,
    },
    /// Find the nearest ancestor holding a role
    Leader { user: UserId, role: String },
    /// Report cycles already present in the stored graph
    Audit,
    /// Row counts
    Stats,
}

fn parse_role(raw: &str) -> Result<Role> {
    Role::from_str_loose(raw).ok_or_else(|| NetworkError::InvalidInput(format!("unknown role '{raw}'")))
}

fn parse_edge_role(raw: &str) -> Result<EdgeRole> {
    EdgeRole::from_str_loose(raw)
        .ok_or_else(|| NetworkError::InvalidInput(format!("unknown edge role '{raw}'")))
}

/// Execute one parsed command against the resolved configuration.
pub async fn run(command: Commands, mut config: NetworkConfig) -> Result<()> {
    let store = HierarchyStore::new(&config.database.path)?;

    match command {
        Commands::Init => {
            let stats = store.stats()?;
            println!(
                "{} database ready at {} ({} users, {} edges, {} guests)",
                style("✓").green(),
                style(&config.database.path).bold(),
                stats.users,
                stats.edges,
                stats.guests
            );
        }
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            let addr: SocketAddr = config.server.addr.parse().map_err(|_| {
                NetworkError::Config(format!("invalid listen address '{}'", config.server.addr))
            })?;
            let service = NetworkService::new(store, &config);
            run_http_server(service, addr)
                .await
                .map_err(|e| NetworkError::Other(e.to_string()))?;
        }
        Commands::Tree { user, json } => {
            let tree = TreeBuilder::new(&store).build_tree(user)?;
            if json {
                let text = serde_json::to_string_pretty(&tree)
                    .map_err(|e| NetworkError::Other(e.to_string()))?;
                println!("{text}");
            } else {
                print!("{}", tree.render_text());
                println!("{}", style(format!("{} members", tree.size())).dim());
            }
        }
        Commands::Descendants { user, role } => {
            store.require_user(user)?;
            let role = role.as_deref().map(parse_edge_role).transpose()?;
            let levels = NetworkResolver::new(&store).resolve_levels(user, role)?;
            let mut users = store.get_users(&levels.keys().copied().collect::<Vec<_>>())?;
            users.sort_by_key(|u| (levels.get(&u.id).copied().unwrap_or(0), u.id));
            for u in &users {
                let depth = levels.get(&u.id).copied().unwrap_or(0);
                println!(
                    "{:>3}  {:>6}  {}  {}",
                    depth,
                    u.id,
                    u.display_name,
                    style(&u.email).dim()
                );
            }
            println!("{}", style(format!("{} descendants", users.len())).dim());
        }
        Commands::Assign { child, parent, role } => {
            let role = parse_edge_role(&role)?;
            store.set_parent(child, parent, role)?;
            println!(
                "{} {} is now under {} ({})",
                style("✓").green(),
                child,
                parent,
                role
            );
        }
        Commands::Leader { user, role } => {
            let role = parse_role(&role)?;
            let resolver =
                LeaderResolver::new(&store).with_max_hops(config.hierarchy.max_leader_hops);
            match resolver.resolve_ancestor_by_role(user, role)? {
                Some(leader) => {
                    let leader = store.require_user(leader)?;
                    println!("{} {}", leader.id, leader.display_name);
                }
                None => println!("{}", style(format!("no {role} above user {user}")).yellow()),
            }
        }
        Commands::Audit => {
            let cycles = CycleGuard::new(&store).detect_cycles()?;
            if cycles.is_empty() {
                println!("{} no cycles", style("✓").green());
            } else {
                for cycle in &cycles {
                    println!(
                        "{} cycle of {}: {:?}",
                        style("✗").red(),
                        cycle.size,
                        cycle.user_ids
                    );
                }
                return Err(NetworkError::Other(format!(
                    "{} cycle(s) found in hierarchy",
                    cycles.len()
                )));
            }
        }
        Commands::Stats => {
            let stats = store.stats()?;
            println!("users:  {}", stats.users);
            println!("edges:  {}", stats.edges);
            println!("guests: {}", stats.guests);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assign_with_default_role() {
        let cli = Cli::parse_from(["church-network", "assign", "3", "2"]);
        match cli.command {
            Commands::Assign { child, parent, role } => {
                assert_eq!((child, parent), (3, 2));
                assert_eq!(parse_edge_role(&role).unwrap(), EdgeRole::Disciple);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_db_flag_after_subcommand() {
        let cli = Cli::parse_from(["church-network", "stats", "--db", "x.db"]);
        assert_eq!(cli.db.as_deref(), Some("x.db"));
    }

    #[test]
    fn unknown_role_is_invalid_input() {
        assert!(matches!(parse_role("bishop"), Err(NetworkError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn assign_and_audit_against_temp_db() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = NetworkConfig::default();
        config.database.path = dir.path().join("net.db").to_string_lossy().into_owned();

        {
            let store = HierarchyStore::new(&config.database.path).unwrap();
            store
                .insert_user(&crate::types::NewUser::new("p", "p@x.org", &[Role::Pastor]))
                .unwrap();
            store
                .insert_user(&crate::types::NewUser::new("d", "d@x.org", &[Role::Disciple]))
                .unwrap();
        }

        run(
            Commands::Assign {
                child: 2,
                parent: 1,
                role: "disciple".into(),
            },
            config.clone(),
        )
        .await
        .unwrap();
        let err = run(
            Commands::Assign {
                child: 1,
                parent: 2,
                role: "disciple".into(),
            },
            config.clone(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetworkError::CycleRejected { .. }));
        run(Commands::Audit, config).await.unwrap();
    }
}
