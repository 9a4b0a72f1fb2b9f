use anyhow::{Context, Result, anyhow, bail};
use blastpipe::{
    BlastQuery, FlagValue, parse_blast_xml_file, read_query_fasta, run_blast_with_cancel,
    runner::CancelHandle,
    tools::{
        BLASTN_ENV_BIN, BLASTP_ENV_BIN, DEFAULT_BLASTN_BIN, DEFAULT_BLASTP_BIN,
        active_resolution_label, resolve_executable_path, resolve_tool_executable,
    },
};
use log::info;
use serde::Serialize;
use std::env;

#[derive(Serialize)]
struct ToolResolution {
    program: String,
    env_var: String,
    resolution: String,
    path: Option<String>,
}

#[derive(Debug, Default)]
struct SearchOptions {
    db: Option<String>,
    query: Option<String>,
    exec: Option<String>,
    flags: Vec<(String, FlagValue)>,
}

fn usage() {
    eprintln!(
        "Usage:\n  \
  blastpipe_cli --version\n  \
  blastpipe_cli blastp|blastn --db DB --query QUERY.fa [OPTIONS]\n  \
  blastpipe_cli parse OUTPUT.xml\n  \
  blastpipe_cli tools\n\n  \
  Search options:\n    \
    --set NAME=VALUE   pass -NAME VALUE to the BLAST program\n    \
    --switch NAME      pass -NAME without a value\n    \
    --unset NAME       drop a preset flag (e.g. num_threads)\n    \
    --exec PATH        run this executable instead of the default\n\n  \
  The report is printed as JSON. RUST_LOG=info shows the command line."
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text =
        serde_json::to_string_pretty(value).context("Could not serialize JSON output")?;
    println!("{text}");
    Ok(())
}

fn typed_flag_value(raw: &str) -> FlagValue {
    if let Ok(value) = raw.parse::<i64>() {
        FlagValue::Integer(value)
    } else if let Ok(value) = raw.parse::<f64>() {
        FlagValue::Real(value)
    } else {
        FlagValue::Text(raw.to_string())
    }
}

fn parse_search_options(args: &[String]) -> Result<SearchOptions> {
    let mut options = SearchOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("Missing value for {name}"))
        };
        match arg.as_str() {
            "--db" => options.db = Some(value("--db")?),
            "--query" => options.query = Some(value("--query")?),
            "--exec" => options.exec = Some(value("--exec")?),
            "--set" => {
                let pair = value("--set")?;
                let (name, raw) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Expected NAME=VALUE after --set, found '{pair}'"))?;
                options
                    .flags
                    .push((name.trim_start_matches('-').to_string(), typed_flag_value(raw)));
            }
            "--switch" => {
                let name = value("--switch")?;
                options
                    .flags
                    .push((name.trim_start_matches('-').to_string(), FlagValue::Switch(true)));
            }
            "--unset" => {
                let name = value("--unset")?;
                options
                    .flags
                    .push((name.trim_start_matches('-').to_string(), FlagValue::Switch(false)));
            }
            other => bail!("Unknown search option '{other}'"),
        }
    }
    Ok(options)
}

fn search(program: &str, args: &[String]) -> Result<()> {
    let options = parse_search_options(args)?;
    let db = options
        .db
        .ok_or_else(|| anyhow!("{program} requires --db"))?;
    let query_path = options
        .query
        .ok_or_else(|| anyhow!("{program} requires --query"))?;
    let queries = read_query_fasta(&query_path)?;
    info!("Loaded {} query sequence(s) from '{}'", queries.len(), query_path);

    let mut query = match program {
        "blastp" => BlastQuery::blastp(queries, &db),
        _ => BlastQuery::blastn(queries, &db),
    };
    if let Some(exec) = options.exec {
        query = query.with_executable(&exec);
    }
    for (name, value) in options.flags {
        query.set_flag(&name, value);
    }

    let report = run_blast_with_cancel(&query, &CancelHandle::new())?;
    if !report.exited_cleanly() {
        eprintln!(
            "Warning: {program} exited with {:?} but produced a complete report",
            report.exit_code
        );
    }
    print_json(&report.output)
}

fn tool_resolutions() -> Vec<ToolResolution> {
    [
        (DEFAULT_BLASTP_BIN, BLASTP_ENV_BIN),
        (DEFAULT_BLASTN_BIN, BLASTN_ENV_BIN),
    ]
    .into_iter()
    .map(|(program, env_var)| ToolResolution {
        program: program.to_string(),
        env_var: env_var.to_string(),
        resolution: active_resolution_label(env_var, program),
        path: resolve_executable_path(&resolve_tool_executable(env_var, program))
            .map(|path| path.display().to_string()),
    })
    .collect()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() <= 1 {
        usage();
        bail!("Missing command");
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("blastpipe {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let command = &args[1];
    match command.as_str() {
        "blastp" | "blastn" => search(command, &args[2..]),
        "parse" => {
            if args.len() <= 2 {
                usage();
                bail!("Missing path for parse");
            }
            let report = parse_blast_xml_file(&args[2])?;
            print_json(&report)
        }
        "tools" => print_json(&tool_resolutions()),
        _ => {
            usage();
            Err(anyhow!("Unknown command '{command}'"))
        }
    }
}
