use clap::{Parser, Subcommand, ValueEnum};
use cmskit::{CmsError, Context, DataHandle, Row, Value};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

/// cmskit CLI: browse and edit configured datasets from the command line
#[derive(Parser)]
#[command(name = "cmskit", version, about)]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "cmskit.yaml")]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show the field metadata of a dataset
    Fields {
        /// Dataset name
        dataset: String,
    },

    /// List rows of a dataset
    Rows {
        /// Dataset name
        dataset: String,
        /// Equality filters (e.g. --where status=live)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Field to order by
        #[arg(long)]
        order: Option<String>,
        /// Order descending
        #[arg(long)]
        desc: bool,
    },

    /// Get a single row by primary key
    Get {
        /// Dataset name
        dataset: String,
        /// Primary key value
        id: String,
    },

    /// Insert a new row
    Insert {
        /// Dataset name
        dataset: String,
        /// Field values (e.g. --field title="Home")
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update an existing row
    Update {
        /// Dataset name
        dataset: String,
        /// Primary key value
        id: String,
        /// Field values to change (e.g. --field status=live)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Delete a row
    Delete {
        /// Dataset name
        dataset: String,
        /// Primary key value
        id: String,
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Read a special view: a rowset name or registry:<category>
    Special {
        /// Source name
        name: String,
        /// Dataset the view belongs to
        #[arg(long)]
        dataset: Option<String>,
    },

    /// List constructed instances of a registry category (e.g. data)
    Registry {
        /// Category path, segments separated by '/'
        category: String,
    },
}

#[derive(Serialize)]
struct Listing {
    count: usize,
    summaries: Row,
    rows: Vec<Row>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

/// Numbers, booleans and null are read as such; anything else is text.
fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(&json),
        Err(_) => Value::from(raw),
    }
}

fn fields_to_row(fields: &[(String, String)]) -> Row {
    fields
        .iter()
        .map(|(key, raw)| (key.as_str(), parse_value(raw)))
        .collect()
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let context = Context::open(&cli.config)?;

    match cli.command {
        Command::Fields { dataset } => {
            let handle = context.dataset(&dataset)?;
            let mut stack = context.stack(Some(handle));
            let view = stack.start_special("fields")?;
            print_output(&listing(&view), &cli.format)?;
        }

        Command::Rows {
            dataset,
            filters,
            order,
            desc,
        } => {
            let handle = context.dataset(&dataset)?;
            let conditions: Vec<String> = filters
                .iter()
                .map(|(field, raw)| handle.filter(field, parse_value(raw)))
                .collect();
            let mut filter = handle.conjoin(&conditions);
            if let Some(order) = order {
                filter.push_str(&handle.order(&order, desc));
            }
            let mut stack = context.stack(Some(handle));
            let view = stack.start(&filter)?;
            print_output(&listing(&view), &cli.format)?;
        }

        Command::Get { dataset, id } => {
            let handle = context.dataset(&dataset)?;
            let row = require_row(&handle, &dataset, &id)?;
            print_output(&row, &cli.format)?;
        }

        Command::Insert { dataset, fields } => {
            let handle = context.dataset(&dataset)?;
            let mut row = fields_to_row(&fields);
            let id = handle.put(&mut row)?;
            print_output(&serde_json::json!({ "id": id }), &cli.format)?;
        }

        Command::Update {
            dataset,
            id,
            fields,
        } => {
            let handle = context.dataset(&dataset)?;
            let old = require_row(&handle, &dataset, &id)?;
            let mut new = old.clone();
            for (key, value) in fields_to_row(&fields) {
                new.insert(key, value);
            }
            handle.update(&old, &new)?;
            print_output(&serde_json::json!({ "ok": true, "id": id }), &cli.format)?;
        }

        Command::Delete {
            dataset,
            id,
            dry_run,
        } => {
            let handle = context.dataset(&dataset)?;
            let row = require_row(&handle, &dataset, &id)?;
            if dry_run {
                print_output(
                    &serde_json::json!({
                        "dry_run": true,
                        "would_delete": { "dataset": dataset, "id": id },
                        "row": row,
                    }),
                    &cli.format,
                )?;
            } else {
                handle.delete(parse_value(&id))?;
                print_output(&serde_json::json!({ "ok": true, "deleted": id }), &cli.format)?;
            }
        }

        Command::Special { name, dataset } => {
            let handle = dataset.map(|d| context.dataset(&d)).transpose()?;
            let mut stack = context.stack(handle);
            let view = stack.start_special(&name)?;
            print_output(&listing(&view), &cli.format)?;
        }

        Command::Registry { category } => {
            let path: Vec<&str> = category.split('/').collect();
            let rows = context.registry().describe(&path)?;
            print_output(&rows, &cli.format)?;
        }
    }

    Ok(())
}

fn require_row(handle: &Rc<DataHandle>, dataset: &str, id: &str) -> Result<Row, CmsError> {
    handle.row(parse_value(id))?.ok_or_else(|| CmsError::NotFound {
        dataset: dataset.to_string(),
        id: id.to_string(),
    })
}

fn listing(view: &cmskit::View) -> Listing {
    Listing {
        count: view.count(),
        summaries: view.summaries(),
        rows: view.rows().iter().map(|r| r.row.clone()).collect(),
    }
}

fn print_output<T: Serialize>(value: &T, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
