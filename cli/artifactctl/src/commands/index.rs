//! Index commands.

use anyhow::Result;
use artifactctl_index::IndexEntry;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_info, print_output};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct IndexCommand {
    #[command(subcommand)]
    command: IndexSubcommand,
}

#[derive(Debug, Subcommand)]
enum IndexSubcommand {
    /// List every artifact known to the configured indexes.
    List,

    /// Search artifacts by name, keyword or description.
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    keyword: String,
}

#[derive(Debug, Serialize, Tabled)]
struct EntryRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Type")]
    artifact_type: String,

    #[tabled(rename = "Location")]
    location: String,

    #[tabled(rename = "Signed")]
    signed: bool,

    #[tabled(rename = "Description")]
    description: String,
}

impl From<&IndexEntry> for EntryRow {
    fn from(entry: &IndexEntry) -> Self {
        Self {
            name: entry.name.clone(),
            artifact_type: entry.artifact_type.clone(),
            location: entry.location(),
            signed: entry
                .signature
                .as_ref()
                .is_some_and(|s| s.cosign.is_some()),
            description: entry.description.clone().unwrap_or_default(),
        }
    }
}

impl IndexCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        if ctx.indexes.is_empty() {
            print_info("No indexes configured. Use --indexes or ARTIFACTCTL_INDEXES.");
            return Ok(());
        }
        let cache = ctx.index_cache().await?;

        let entries = match &self.command {
            IndexSubcommand::List => cache.entries(),
            IndexSubcommand::Search(args) => cache.search(&args.keyword),
        };
        let rows: Vec<EntryRow> = entries.into_iter().map(EntryRow::from).collect();
        print_output(&rows, ctx.format);
        Ok(())
    }
}
