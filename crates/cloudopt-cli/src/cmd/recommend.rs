use crate::cmd::{parse_id, runtime, Workspace};
use crate::output::{fmt_time, or_dash, print_fields, print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use cloudopt_core::io;
use cloudopt_core::recommend::AccountInventory;
use cloudopt_core::recommendation::Recommendation;
use cloudopt_core::types::RecommendationStatus;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum RecommendSubcommand {
    /// Detect opportunities for one account and store them as open
    Generate {
        #[arg(long)]
        account: String,
        /// YAML or JSON file with `resources` and `costs`
        #[arg(long)]
        inventory: Option<PathBuf>,
    },

    /// List recommendations, newest first
    List {
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        status: Option<RecommendationStatus>,
    },

    /// Show one recommendation
    Show { id: String },

    /// Dismiss an open recommendation
    Dismiss { id: String },

    /// Counts and savings totals
    Summary {
        #[arg(long)]
        account: Option<String>,
    },
}

pub fn run(root: &Path, subcmd: RecommendSubcommand, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::open(root)?;
    let generator = ws.engines.recommendations();

    match subcmd {
        RecommendSubcommand::Generate { account, inventory } => {
            let inventory = match inventory {
                Some(path) => load_inventory(&path)?,
                None => AccountInventory::default(),
            };
            let provider = ws.provider(&account)?;
            let created = runtime()?
                .block_on(generator.generate(&account, provider.as_ref(), &inventory))
                .with_context(|| format!("failed to generate recommendations for '{account}'"))?;
            if json {
                return print_json(&created);
            }
            if created.is_empty() {
                println!("No new recommendations for '{account}'.");
            } else {
                println!("Created {} recommendation(s):", created.len());
                table(&created);
            }
        }
        RecommendSubcommand::List { account, status } => {
            let recs = generator.list(account.as_deref(), status)?;
            if json {
                return print_json(&recs);
            }
            if recs.is_empty() {
                println!("No recommendations.");
            } else {
                table(&recs);
            }
        }
        RecommendSubcommand::Show { id } => {
            let rec = generator.get(parse_id(&id)?)?;
            if json {
                return print_json(&rec);
            }
            print_fields(&[
                ("id", rec.id.to_string()),
                ("account", rec.account_id.clone()),
                ("type", rec.recommendation_type.to_string()),
                ("status", rec.status.to_string()),
                ("priority", rec.priority.to_string()),
                ("resource", or_dash(rec.resource_id())),
                ("savings", savings(&rec)),
                ("created", fmt_time(Some(rec.created_at))),
                ("updated", fmt_time(Some(rec.updated_at))),
            ]);
            if !rec.details.is_null() {
                println!("\n{}", serde_json::to_string_pretty(&rec.details)?);
            }
        }
        RecommendSubcommand::Dismiss { id } => {
            let rec = generator.dismiss(parse_id(&id)?, Utc::now())?;
            if json {
                return print_json(&rec);
            }
            println!("Dismissed recommendation {}.", rec.id);
        }
        RecommendSubcommand::Summary { account } => {
            let summary = generator.summary(account.as_deref())?;
            if json {
                return print_json(&summary);
            }
            println!("Total: {}", summary.total);
            let section = |title: &str, counts: Vec<(String, String)>| {
                if counts.is_empty() {
                    return;
                }
                println!("\n{title}:");
                for (key, value) in counts {
                    println!("  {key:<16} {value}");
                }
            };
            let counts = |m: &BTreeMap<String, usize>| -> Vec<(String, String)> {
                m.iter().map(|(k, v)| (k.clone(), v.to_string())).collect()
            };
            section("By status", counts(&summary.by_status));
            section("By priority", counts(&summary.by_priority));
            section("By type", counts(&summary.by_type));
            section(
                "Open savings",
                summary
                    .open_savings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            );
            section(
                "Realized savings",
                summary
                    .realized_savings
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            );
        }
    }
    Ok(())
}

fn load_inventory(path: &Path) -> anyhow::Result<AccountInventory> {
    io::read_yaml(path).with_context(|| format!("failed to load inventory {}", path.display()))
}

fn savings(rec: &Recommendation) -> String {
    rec.estimated_savings
        .as_ref()
        .map(|s| format!("{} {}/{}", s.amount, s.currency, s.period))
        .unwrap_or_else(|| "-".to_string())
}

fn table(recs: &[Recommendation]) {
    let rows = recs
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.recommendation_type.to_string(),
                r.priority.to_string(),
                r.status.to_string(),
                or_dash(r.resource_id()),
                savings(r),
            ]
        })
        .collect();
    print_table(&["ID", "TYPE", "PRIORITY", "STATUS", "RESOURCE", "SAVINGS"], rows);
}
