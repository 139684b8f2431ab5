use anyhow::Result;
use askdb::config::PipelineConfig;
use askdb::normalizer::FinalAnswer;
use askdb::pipeline::Pipeline;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "askdb")]
#[command(about = "Ask natural-language questions about your tabular data")]
struct Args {
    /// Language model to use ("GPT-3.5 Turbo" or "GPT-4 Turbo")
    #[arg(short, long, default_value = "GPT-3.5 Turbo")]
    model: String,

    /// Postgres connection string (or set DATABASE_URL env var)
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a CSV file into the database as a table
    Ingest {
        /// Path to the .csv file
        file: PathBuf,
    },
    /// Ask a question about the data
    Ask {
        /// The question in natural language
        question: String,

        /// Table the question is likely about
        #[arg(short, long)]
        table: Option<String>,
    },
    /// List the tables in the database
    Tables,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();

    let database_url = args
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("set DATABASE_URL or pass --database-url"))?;

    let config = PipelineConfig::from_env(&args.model)?;
    if config.tracing_enabled {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }
    let pipeline = Pipeline::connect(config, &database_url).await?;

    match args.command {
        Command::Ingest { file } => {
            let bytes = std::fs::read(&file)?;
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let table = pipeline.ingest(&bytes, &filename).await?;
            info!("Ingested {} rows", table.row_count.unwrap_or(0));
            println!(
                "Loaded {:?} into table {} ({} rows)",
                filename,
                table.name,
                table.row_count.unwrap_or(0)
            );
        }
        Command::Ask { question, table } => {
            let response = pipeline.ask(&question, table.as_deref()).await?;
            if !response.complete {
                println!("(partial answer: step budget exhausted)");
            }
            match response.answer {
                FinalAnswer::Text(text) => println!("{}", text),
                FinalAnswer::Table(result) => {
                    println!("{}", result.columns.join(" | "));
                    for row in &result.rows {
                        let line = result
                            .columns
                            .iter()
                            .map(|c| {
                                row.get(c)
                                    .map(render_cell)
                                    .unwrap_or_else(|| "NULL".to_string())
                            })
                            .collect::<Vec<_>>()
                            .join(" | ");
                        println!("{}", line);
                    }
                }
            }
            if let Some(sql) = response.sql {
                info!("Answered with SQL: {}", sql);
            }
        }
        Command::Tables => {
            let tables = pipeline.list_tables().await?;
            for table in tables {
                println!(
                    "{} ({} columns)",
                    table.name,
                    table.columns.len()
                );
            }
        }
    }

    pipeline.close().await;
    Ok(())
}

fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}
