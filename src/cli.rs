use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP daemon
    Serve {
        /// Listen address, overrides `bind` from config.yaml
        #[clap(short, long)]
        bind: Option<String>,
    },

    /// Index catalog products and save their vectors
    Index {
        /// Product ids to index
        ids: Vec<u64>,

        /// Index every product in the catalog
        #[clap(short, long, default_value = "false")]
        all: bool,
    },

    /// Find catalog products that look like an image
    Search {
        /// Local file path or http(s) url
        image: String,

        /// Number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Only products with at least this much stock
        #[clap(long, allow_hyphen_values = true)]
        min_stock: Option<i64>,

        /// Comma separated list of allowed categories
        #[clap(short, long)]
        categories: Option<String>,

        #[clap(long)]
        min_price: Option<f64>,

        #[clap(long)]
        max_price: Option<f64>,
    },
}

/// Split a comma separated list, dropping empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
