mod ask;
mod session;

use std::path::PathBuf;

use anyhow::{Result, bail};
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::logging;

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Commands")
        .command("ask", "Answer one question against the database")
        .command("schema", "Print the schema text the model sees")
        .command("demo", "Run the bundled demo questions")
        .command("help", "Show this help")
        .print();

    GuideSection::new("Options")
        .text("--question, -q <text>   Question to answer (ask)")
        .text("--db <path>             SQLite database (default: bundled demo data in memory)")
        .text("--seed <file.sql>       Seed script applied before the run")
        .text("--config <file.toml>    Config file (default: <config dir>/askdb/config.toml)")
        .text("--model <id>            Model id override")
        .text("--max-attempts <n>      Attempt budget override")
        .text("--trace                 Print the execution trace after the answer")
        .text("--trace-file <path>     Append trace events as JSON lines")
        .text("--log-file <path>       Also write logs to this file")
        .text("--verbose, -v           Debug logging")
        .blank()
        .hint("askdb ask -q \"Who taught CS101 in Spring 2026?\"")
        .hint("askdb ask --db school.db -q \"How many students are there?\" --trace")
        .hint("askdb schema --seed university.sql")
        .print();

    println!(
        "\n {} {} <command> [options]\n",
        style("Usage:").bold(),
        style("askdb").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CommandArgs {
    pub question: Option<String>,
    pub db: Option<PathBuf>,
    pub seed: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub model: Option<String>,
    pub max_attempts: Option<u32>,
    pub trace: bool,
    pub trace_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub help: bool,
}

pub(crate) fn parse_command_args(args: &[String], start: usize) -> Result<CommandArgs> {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = args.get(i + 1).cloned();
        let mut takes_value = true;
        match flag {
            "--question" | "-q" => parsed.question = value.clone(),
            "--db" => parsed.db = value.clone().map(PathBuf::from),
            "--seed" => parsed.seed = value.clone().map(PathBuf::from),
            "--config" => parsed.config = value.clone().map(PathBuf::from),
            "--model" => parsed.model = value.clone(),
            "--trace-file" => parsed.trace_file = value.clone().map(PathBuf::from),
            "--log-file" => parsed.log_file = value.clone().map(PathBuf::from),
            "--max-attempts" => {
                parsed.max_attempts = match &value {
                    Some(v) => match v.parse() {
                        Ok(n) => Some(n),
                        Err(_) => bail!("--max-attempts expects a number, got '{}'", v),
                    },
                    None => None,
                }
            }
            "--trace" => {
                parsed.trace = true;
                takes_value = false;
            }
            "--verbose" | "-v" => {
                parsed.verbose = true;
                takes_value = false;
            }
            "--help" | "-h" => {
                parsed.help = true;
                takes_value = false;
            }
            other => bail!("unknown option: {}", other),
        }
        if takes_value && value.is_none() {
            bail!("{} expects a value", flag);
        }
        i += if takes_value { 2 } else { 1 };
    }
    Ok(parsed)
}

/// Returns the process exit code.
pub async fn run_main() -> Result<i32> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(0);
    };

    match cmd {
        "help" | "--help" | "-h" => {
            print_help();
            return Ok(0);
        }
        "ask" | "schema" | "demo" => {}
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            return Ok(2);
        }
    }

    let parsed = match parse_command_args(&args, 2) {
        Ok(parsed) => parsed,
        Err(e) => {
            print_error(&e.to_string());
            print_help();
            return Ok(2);
        }
    };
    if parsed.help {
        print_help();
        return Ok(0);
    }
    logging::init_logging(parsed.verbose, parsed.log_file.as_deref())?;

    match cmd {
        "ask" => ask::run_ask(&parsed).await,
        "schema" => ask::run_schema(&parsed).await,
        _ => ask::run_demo(&parsed).await,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_command_args;
    use std::path::PathBuf;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_command_args_reads_question_and_paths() {
        let args = argv(&[
            "askdb",
            "ask",
            "-q",
            "Who taught CS101?",
            "--db",
            "school.db",
            "--max-attempts",
            "5",
            "--trace",
            "--verbose",
        ]);
        let parsed = parse_command_args(&args, 2).unwrap();
        assert_eq!(parsed.question.as_deref(), Some("Who taught CS101?"));
        assert_eq!(parsed.db, Some(PathBuf::from("school.db")));
        assert_eq!(parsed.max_attempts, Some(5));
        assert!(parsed.trace);
        assert!(parsed.verbose);
        assert!(parsed.seed.is_none());
    }

    #[test]
    fn parse_command_args_reads_file_options() {
        let args = argv(&[
            "askdb",
            "ask",
            "--question",
            "q",
            "--seed",
            "seed.sql",
            "--config",
            "askdb.toml",
            "--model",
            "gpt-4o",
            "--trace-file",
            "trace.jsonl",
            "--log-file",
            "askdb.log",
        ]);
        let parsed = parse_command_args(&args, 2).unwrap();
        assert_eq!(parsed.seed, Some(PathBuf::from("seed.sql")));
        assert_eq!(parsed.config, Some(PathBuf::from("askdb.toml")));
        assert_eq!(parsed.model.as_deref(), Some("gpt-4o"));
        assert_eq!(parsed.trace_file, Some(PathBuf::from("trace.jsonl")));
        assert_eq!(parsed.log_file, Some(PathBuf::from("askdb.log")));
    }

    #[test]
    fn parse_command_args_rejects_bad_input() {
        assert!(parse_command_args(&argv(&["askdb", "ask", "--max-attempts", "many"]), 2).is_err());
        assert!(parse_command_args(&argv(&["askdb", "ask", "--db"]), 2).is_err());
        assert!(parse_command_args(&argv(&["askdb", "ask", "--frobnicate"]), 2).is_err());
    }
}
